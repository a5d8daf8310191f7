//! [`Engine`] over libcurl's multi interface.
//!
//! curl's socket and timer callbacks must be `Send + 'static`, so they only
//! record what curl asked for. The records are replayed into the driver's
//! [`EngineHooks`] once the curl call that produced them has returned.
//!
//! Easy handles are added to and removed from the multi handle with the raw
//! libcurl calls, so the `Easy2` stays owned by the transfer (or its
//! [`CurlHandle`]) whatever the outcome and a refused call can hand it
//! back.

use super::{
    Completion, Engine, EngineHooks, EngineSettings, EventMask, Rejected, SocketInterest,
    TransferId,
};
use crate::base::neterror::NetError;
use crate::memory::{BlockAllocator, BlockBuf};
use ::curl::easy::{Easy2, Handler, List, WriteError};
use ::curl::multi::{Events, Multi, SocketEvents};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

#[derive(Debug)]
enum HookRequest {
    Socket(RawFd, SocketInterest),
    Timer(Option<Duration>),
}

type RequestQueue = Arc<Mutex<Vec<HookRequest>>>;

fn easy_error(e: ::curl::Error) -> NetError {
    NetError::EngineFailure {
        code: e.code() as i32,
        message: e.to_string(),
    }
}

fn multi_error(e: ::curl::MultiError) -> NetError {
    NetError::EngineFailure {
        code: e.code() as i32,
        message: e.to_string(),
    }
}

// `CURLM_ADDED_ALREADY` from curl.h; not exported by the curl-sys bindings.
const CURLM_ADDED_ALREADY: curl_sys::CURLMcode = 7;

fn multi_code_error(code: curl_sys::CURLMcode) -> NetError {
    if code == CURLM_ADDED_ALREADY {
        return NetError::AlreadyAttached;
    }
    multi_error(::curl::MultiError::new(code))
}

fn transfer_error(e: ::curl::Error) -> NetError {
    if e.is_couldnt_resolve_host() {
        return NetError::NameNotResolved;
    }
    if e.is_operation_timedout() {
        return NetError::TimedOut;
    }
    NetError::TransferFailed {
        code: e.code() as i32,
        message: e.to_string(),
    }
}

fn socket_interest(events: SocketEvents) -> SocketInterest {
    if events.remove() {
        SocketInterest::Remove
    } else if events.input_and_output() {
        SocketInterest::ReadWrite
    } else if events.input() {
        SocketInterest::Read
    } else if events.output() {
        SocketInterest::Write
    } else {
        SocketInterest::Remove
    }
}

/// One curl easy transfer plus the URL it was configured with.
pub struct CurlTransfer<H> {
    easy: Easy2<H>,
    url: Url,
}

impl<H: Handler> CurlTransfer<H> {
    /// Create a transfer fetching `url` into `handler`.
    pub fn new(handler: H, url: Url) -> Result<Self, NetError> {
        let mut easy = Easy2::new(handler);
        easy.url(url.as_str()).map_err(easy_error)?;
        Ok(Self { easy, url })
    }

    /// Like [`new`](CurlTransfer::new), parsing `url` first.
    pub fn parse(handler: H, url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| {
            tracing::debug!(url, error = %e, "rejecting transfer URL");
            NetError::InvalidUrl
        })?;
        Self::new(handler, url)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn easy(&self) -> &Easy2<H> {
        &self.easy
    }

    /// Further curl options (headers, timeouts, TLS) go through here.
    pub fn easy_mut(&mut self) -> &mut Easy2<H> {
        &mut self.easy
    }

    pub fn handler(&self) -> &H {
        self.easy.get_ref()
    }

    /// Response status of the last completed request, 0 if none.
    pub fn response_code(&mut self) -> Result<u32, NetError> {
        self.easy.response_code().map_err(easy_error)
    }

    pub fn into_inner(self) -> Easy2<H> {
        self.easy
    }
}

impl<H> std::fmt::Debug for CurlTransfer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurlTransfer")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

/// A transfer registered with the multi handle.
pub struct CurlHandle<H> {
    easy: Easy2<H>,
    id: TransferId,
    url: Url,
}

impl<H> CurlHandle<H> {
    pub fn id(&self) -> TransferId {
        self.id
    }

    fn into_transfer(self) -> CurlTransfer<H> {
        CurlTransfer {
            easy: self.easy,
            url: self.url,
        }
    }
}

/// Response body sink whose buffer comes from a [`BlockAllocator`].
///
/// Hand it the bridge's allocator (`Bridge::allocator`) so body memory is
/// drawn from the same pool as the rest of the engine's transfer memory.
/// An allocation failure aborts the transfer with curl's write error.
pub struct BodyCollector {
    body: BlockBuf,
}

impl BodyCollector {
    pub fn new(allocator: Arc<dyn BlockAllocator>) -> Self {
        Self {
            body: BlockBuf::empty(allocator),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> BlockBuf {
        self.body
    }
}

impl Handler for BodyCollector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        match self.body.extend_from_slice(data) {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                tracing::warn!(error = %e, received = self.body.len(), "response body allocation failed");
                Ok(0)
            }
        }
    }
}

impl std::fmt::Debug for BodyCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyCollector")
            .field("body", &self.body)
            .finish()
    }
}

/// libcurl multi-interface engine.
///
/// libcurl's own memory callbacks can only be installed before its global
/// initialization, which the `curl` crate performs when it loads. The
/// allocator from [`EngineSettings`] backs transfer-side memory instead:
/// response bodies collected through [`BodyCollector`].
pub struct CurlEngine<H> {
    multi: Multi,
    requests: RequestQueue,
    finished: VecDeque<Completion>,
    allocator: Arc<dyn BlockAllocator>,
    _handler: PhantomData<fn() -> H>,
}

impl<H: Handler> CurlEngine<H> {
    pub fn allocator(&self) -> &Arc<dyn BlockAllocator> {
        &self.allocator
    }

    /// Replay recorded hook requests. Every request is applied; the first
    /// failure is returned.
    fn flush(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), NetError> {
        let requests = std::mem::take(
            &mut *self
                .requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut first_error = None;
        for request in requests {
            let result = match request {
                HookRequest::Socket(fd, interest) => hooks.socket_interest(fd, interest),
                HookRequest::Timer(deadline) => hooks.timer_deadline(deadline),
            };
            if let Err(e) = result {
                tracing::warn!(?request, error = %e, "driver rejected curl hook request");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn collect_messages(&mut self) {
        let finished = &mut self.finished;
        self.multi.messages(|msg| {
            let Some(result) = msg.result() else {
                return;
            };
            match msg.token() {
                Ok(token) => finished.push_back(Completion {
                    id: TransferId(token as u64),
                    result: result.map_err(transfer_error),
                }),
                Err(e) => tracing::error!(error = %e, "curl message without token"),
            }
        });
    }

    fn detach_easy(&self, easy: &Easy2<H>) -> Result<(), NetError> {
        // SAFETY: both handles are live; `easy` was added to this multi.
        let code = unsafe { curl_sys::curl_multi_remove_handle(self.multi.raw(), easy.raw()) };
        if code == curl_sys::CURLM_OK {
            Ok(())
        } else {
            Err(multi_code_error(code))
        }
    }

    fn after_action(
        &mut self,
        action: Result<u32, ::curl::MultiError>,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), NetError> {
        self.collect_messages();
        let hooked = self.flush(hooks);
        action.map_err(multi_error)?;
        hooked
    }
}

impl<H: Handler> Engine for CurlEngine<H> {
    type Transfer = CurlTransfer<H>;
    type Handle = CurlHandle<H>;

    fn init(settings: EngineSettings) -> Result<Self, NetError> {
        ::curl::init();
        let mut multi = Multi::new();
        let requests: RequestQueue = Arc::new(Mutex::new(Vec::new()));

        let queue = Arc::clone(&requests);
        multi
            .socket_function(move |fd, events, _| {
                queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(HookRequest::Socket(fd, socket_interest(events)));
            })
            .map_err(|e| NetError::EngineInitFailed(e.to_string()))?;

        let queue = Arc::clone(&requests);
        multi
            .timer_function(move |deadline| {
                queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(HookRequest::Timer(deadline));
                true
            })
            .map_err(|e| NetError::EngineInitFailed(e.to_string()))?;

        tracing::debug!(
            allocator = settings.allocator.name(),
            version = ::curl::Version::get().version(),
            "curl multi engine initialized"
        );
        Ok(Self {
            multi,
            requests,
            finished: VecDeque::new(),
            allocator: settings.allocator,
            _handler: PhantomData,
        })
    }

    fn add(
        &mut self,
        transfer: CurlTransfer<H>,
        id: TransferId,
        hooks: &mut dyn EngineHooks,
    ) -> Result<CurlHandle<H>, Rejected<CurlTransfer<H>>> {
        let Ok(token) = usize::try_from(id.0) else {
            return Err(Rejected::new(NetError::InvalidArgument, transfer));
        };

        // SAFETY: the easy handle is live and owned by `transfer`;
        // CURLOPT_PRIVATE takes a pointer-sized value.
        let code = unsafe {
            curl_sys::curl_easy_setopt(transfer.easy.raw(), curl_sys::CURLOPT_PRIVATE, token)
        };
        if code != curl_sys::CURLE_OK {
            return Err(Rejected::new(easy_error(::curl::Error::new(code)), transfer));
        }

        // SAFETY: both handles are live. The easy handle stays owned by the
        // returned CurlHandle until `remove` takes it out again.
        let code =
            unsafe { curl_sys::curl_multi_add_handle(self.multi.raw(), transfer.easy.raw()) };
        if code != curl_sys::CURLM_OK {
            return Err(Rejected::new(multi_code_error(code), transfer));
        }

        let CurlTransfer { easy, url } = transfer;
        let handle = CurlHandle { easy, id, url };
        if let Err(error) = self.flush(hooks) {
            match self.detach_easy(&handle.easy) {
                Ok(()) => {
                    if let Err(e) = self.flush(hooks) {
                        tracing::warn!(transfer = %id, error = %e, "hook failed while rolling back add");
                    }
                    return Err(Rejected::new(error, handle.into_transfer()));
                }
                Err(e) => tracing::error!(
                    transfer = %id,
                    error = %e,
                    hook_error = %error,
                    "could not roll back curl add; transfer stays registered"
                ),
            }
        }
        Ok(handle)
    }

    fn remove(
        &mut self,
        handle: CurlHandle<H>,
        hooks: &mut dyn EngineHooks,
    ) -> Result<CurlTransfer<H>, Rejected<CurlHandle<H>>> {
        if let Err(error) = self.detach_easy(&handle.easy) {
            return Err(Rejected::new(error, handle));
        }
        let id = handle.id;
        self.finished.retain(|c| c.id != id);

        // The transfer is already out of the multi handle; a hook failure
        // here must not cost the caller their transfer.
        if let Err(e) = self.flush(hooks) {
            tracing::error!(transfer = %id, error = %e, "hook failed while removing transfer");
        }
        Ok(handle.into_transfer())
    }

    fn socket_action(
        &mut self,
        fd: RawFd,
        events: EventMask,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), NetError> {
        let mut ev = Events::new();
        ev.input(events.is_readable())
            .output(events.is_writable())
            .error(events.is_error());
        let action = self.multi.action(fd, &ev);
        self.after_action(action, hooks)
    }

    fn timer_action(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), NetError> {
        let action = self.multi.timeout();
        self.after_action(action, hooks)
    }

    fn next_completion(&mut self) -> Option<Completion> {
        self.finished.pop_front()
    }

    fn target_url(&self, transfer: &CurlTransfer<H>) -> Option<Url> {
        Some(transfer.url.clone())
    }

    fn override_resolution(
        &self,
        transfer: &mut CurlTransfer<H>,
        host: &str,
        port: u16,
        addrs: &[IpAddr],
    ) -> Result<(), NetError> {
        if addrs.is_empty() {
            return Err(NetError::NameNotResolved);
        }
        let mut list = List::new();
        list.append(&resolve_entry(host, port, addrs))
            .map_err(easy_error)?;
        transfer.easy.resolve(list).map_err(easy_error)
    }
}

impl<H> std::fmt::Debug for CurlEngine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurlEngine")
            .field("finished", &self.finished.len())
            .field("allocator", &self.allocator.name())
            .finish_non_exhaustive()
    }
}

/// `host:port:addr[,addr...]` in `CURLOPT_RESOLVE` syntax.
fn resolve_entry(host: &str, port: u16, addrs: &[IpAddr]) -> String {
    let addrs: Vec<String> = addrs
        .iter()
        .map(|ip| match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        })
        .collect();
    format!("{host}:{port}:{}", addrs.join(","))
}

//! # Reactor - single-threaded readiness dispatcher
//!
//! The reactor owns every registered endpoint in an fd-indexed slot table
//! and a [`Poller`]. One call to [`Reactor::dispatch`] is one loop
//! iteration:
//!
//! 1. Drop endpoints closed since the last pass (deferred close set)
//! 2. Run the idle-timeout sweep over a bounded window of slots
//! 3. Wait for readiness, at most `wait_timeout`
//! 4. Route each ready fd: ERROR first (and nothing else for that fd),
//!    otherwise READ then WRITE
//!
//! ```text
//!   slots[fd] ─┬─ Vacant
//!              ├─ Occupied(endpoint)  ── checkout ──►  Busy  ── checkin ──┐
//!              │        ▲                               │                  │
//!              │        └───────────────────────────────┼──────────────────┘
//!              │                             del_socket │
//!              └─ Released ◄────────────────────────────┘ checkin ──► deferred
//! ```
//!
//! While a callback runs its endpoint is checked out of the table, so the
//! callback can take `&mut Reactor` and still deregister itself. A
//! deregistered endpoint is parked in the deferred set and dropped at the
//! start of the next pass; the endpoint closes its descriptor in `Drop`, so
//! the kernel cannot hand the same fd number to a new socket while events
//! for the old one may still be queued.

use std::mem;
use std::os::unix::io::RawFd;
use std::time::Instant;

use nix::errno::Errno;
use tracing::{debug, error, info, info_span, trace, warn, Span};

use evnet_core::Interest;

use crate::config::ReactorConfig;
use crate::error::{NetError, Result};
use crate::poller::{new_poller, Poller, Readiness};
use crate::socket::{Endpoint, SocketId, SocketMeta, SocketState};
use crate::sys;

enum Slot {
    Vacant,
    Occupied(Box<dyn Endpoint>),
    /// Checked out for a callback.
    Busy,
    /// Deregistered while checked out; goes to the deferred set on checkin.
    Released,
}

struct Entry {
    generation: u32,
    slot: Slot,
}

pub struct Reactor {
    config: ReactorConfig,
    poller: Box<dyn Poller>,
    entries: Vec<Entry>,
    deferred: Vec<Box<dyn Endpoint>>,
    events: Vec<Readiness>,
    scratch: Vec<u8>,
    sweep_cursor: usize,
    count: usize,
    span: Span,
}

impl Reactor {
    /// Raise the descriptor limit, create the platform poller and allocate
    /// the registry.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        config.validate()?;
        let poller = new_poller(config.max_fds).map_err(|e| {
            error!(error = %e, "poller setup failed");
            NetError::PollerSetup(e)
        })?;
        Self::with_poller(config, poller)
    }

    /// Same as `new` with a caller-supplied backend.
    pub fn with_poller(config: ReactorConfig, poller: Box<dyn Poller>) -> Result<Self> {
        config.validate()?;
        sys::raise_nofile_limit(config.max_fds as u64).map_err(|e| {
            error!(wanted = config.max_fds, error = %e, "cannot raise RLIMIT_NOFILE");
            NetError::Rlimit(e)
        })?;

        let mut entries = Vec::with_capacity(config.max_fds);
        entries.resize_with(config.max_fds, || Entry {
            generation: 0,
            slot: Slot::Vacant,
        });

        info!(
            backend = poller.name(),
            max_fds = config.max_fds,
            wait_ms = config.wait_timeout.as_millis() as u64,
            "reactor ready"
        );

        Ok(Self {
            scratch: vec![0u8; config.max_read_size],
            events: Vec::with_capacity(1024),
            config,
            poller,
            entries,
            deferred: Vec::new(),
            sweep_cursor: 0,
            count: 0,
            span: info_span!("reactor"),
        })
    }

    /// Scope every diagnostic of this reactor under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[inline]
    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    #[inline]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Registered endpoints, including ones inside a callback.
    #[inline]
    pub fn socket_count(&self) -> usize {
        self.count
    }

    /// Endpoints waiting for the deferred sweep.
    #[inline]
    pub fn pending_close_count(&self) -> usize {
        self.deferred.len()
    }

    /// Name of the active poller backend.
    pub fn backend(&self) -> &'static str {
        self.poller.name()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register `endpoint` for `interest`.
    ///
    /// On failure the endpoint is dropped, which closes its descriptor.
    pub fn add_socket(&mut self, mut endpoint: Box<dyn Endpoint>, interest: Interest) -> Result<SocketId> {
        let _enter = self.span.enter();
        let fd = endpoint.meta().fd;
        let idx = self.index(fd)?;

        if self.count >= self.entries.len() {
            warn!(fd, capacity = self.entries.len(), "registry full");
            return Err(NetError::RegistryFull { capacity: self.entries.len() });
        }
        if !matches!(self.entries[idx].slot, Slot::Vacant) {
            warn!(fd, "descriptor already registered");
            // The descriptor belongs to the registered endpoint.
            endpoint.meta_mut().fd = -1;
            return Err(NetError::AlreadyRegistered { fd });
        }
        if let Err(e) = self.poller.add_interest(fd, interest) {
            error!(fd, %interest, error = %e, "poller add failed");
            return Err(NetError::Os(e));
        }

        let entry = &mut self.entries[idx];
        // Generation 0 marks an endpoint that was never registered.
        entry.generation = entry.generation.wrapping_add(1).max(1);
        let meta = endpoint.meta_mut();
        meta.generation = entry.generation;
        meta.interest = interest;
        let id = meta.id();
        debug!(
            fd,
            generation = id.generation,
            state = %meta.state,
            kind = %meta.socket_type,
            %interest,
            "socket added"
        );
        entry.slot = Slot::Occupied(endpoint);
        self.count += 1;
        Ok(id)
    }

    /// Replace the interest set of `id`.
    ///
    /// Works on an endpoint that is inside its own callback; that endpoint
    /// keeps its own `meta().interest` in sync.
    pub fn mod_socket(&mut self, id: SocketId, interest: Interest) -> Result<()> {
        let _enter = self.span.enter();
        let idx = self.live_index(id)?;
        if let Err(e) = self.poller.mod_interest(id.fd, interest) {
            error!(fd = id.fd, %interest, error = %e, "poller mod failed");
            return Err(NetError::Os(e));
        }
        if let Slot::Occupied(ep) = &mut self.entries[idx].slot {
            ep.meta_mut().interest = interest;
        }
        trace!(fd = id.fd, %interest, "socket modified");
        Ok(())
    }

    /// Deregister `id` and schedule its destruction. Idempotent; returns
    /// `false` if nothing was registered under `id`.
    ///
    /// Safe to call from any callback, including the endpoint's own.
    pub fn del_socket(&mut self, id: SocketId) -> bool {
        let _enter = self.span.enter();
        let idx = match self.live_index(id) {
            Ok(idx) => idx,
            Err(_) => return false,
        };
        if let Err(e) = self.poller.del_interest(id.fd) {
            // The fd stays open until the endpoint drops, so this only
            // happens if someone closed it behind our back.
            warn!(fd = id.fd, error = %e, "poller del failed");
        }

        let entry = &mut self.entries[idx];
        match mem::replace(&mut entry.slot, Slot::Vacant) {
            Slot::Occupied(mut ep) => {
                ep.meta_mut().state = SocketState::Closing;
                self.deferred.push(ep);
            }
            Slot::Busy => entry.slot = Slot::Released,
            Slot::Vacant | Slot::Released => unreachable!("live_index checked the slot"),
        }
        self.count -= 1;
        debug!(fd = id.fd, generation = id.generation, "socket removed");
        true
    }

    #[inline]
    pub fn contains(&self, id: SocketId) -> bool {
        self.live_index(id).is_ok()
    }

    /// Metadata of a registered endpoint that is not inside a callback.
    pub fn get(&self, id: SocketId) -> Option<&SocketMeta> {
        let idx = self.live_index(id).ok()?;
        match &self.entries[idx].slot {
            Slot::Occupied(ep) => Some(ep.meta()),
            _ => None,
        }
    }

    // ========================================================================
    // Operations on a socket by handle
    // ========================================================================

    /// Send a packet on `id`.
    pub fn send_packet(&mut self, id: SocketId, data: &[u8]) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.with_endpoint(id, |ep, reactor| ep.send_packet(reactor, data))?
    }

    /// Close `id`, notifying its handler.
    pub fn close(&mut self, id: SocketId) -> Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.with_endpoint(id, |ep, reactor| ep.close(reactor))
    }

    /// Change the idle timeout of `id`. Zero disables it.
    pub fn set_timeout(&mut self, id: SocketId, timeout: std::time::Duration) -> Result<()> {
        self.with_endpoint(id, |ep, _| ep.meta_mut().timeout = timeout)
    }

    /// Run `f` with `id` checked out of its slot.
    pub fn with_endpoint<R>(
        &mut self,
        id: SocketId,
        f: impl FnOnce(&mut dyn Endpoint, &mut Reactor) -> R,
    ) -> Result<R> {
        let idx = self.live_index(id)?;
        let mut ep = match mem::replace(&mut self.entries[idx].slot, Slot::Busy) {
            Slot::Occupied(ep) => ep,
            other => {
                self.entries[idx].slot = other;
                return Err(NetError::Busy { fd: id.fd });
            }
        };
        let out = f(ep.as_mut(), self);
        self.checkin(idx, ep);
        Ok(out)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run one loop iteration. Returns the number of readiness events
    /// processed; an interrupted wait counts as zero.
    pub fn dispatch(&mut self) -> Result<usize> {
        let span = self.span.clone();
        let _enter = span.enter();

        self.drain_deferred();
        self.sweep_timeouts(Instant::now());

        let mut events = mem::take(&mut self.events);
        events.clear();
        let waited = self.poller.wait(&mut events, Some(self.config.wait_timeout));
        let n = match waited {
            Ok(_) => events.len(),
            Err(Errno::EINTR) => {
                self.events = events;
                return Ok(0);
            }
            Err(e) => {
                self.events = events;
                error!(error = %e, "poller wait failed");
                return Err(NetError::Os(e));
            }
        };

        for ev in &events {
            self.process_ready(ev.fd, ev.mask);
        }
        self.events = events;
        if n > 0 {
            trace!(events = n, "dispatch");
        }
        Ok(n)
    }

    /// Route one readiness report to its endpoint.
    pub(crate) fn process_ready(&mut self, fd: RawFd, mask: Interest) {
        let idx = match self.index(fd) {
            Ok(idx) => idx,
            Err(_) => {
                error!(fd, %mask, "readiness for descriptor outside registry");
                return;
            }
        };
        let mut ep = match mem::replace(&mut self.entries[idx].slot, Slot::Busy) {
            Slot::Occupied(ep) => ep,
            other => {
                self.entries[idx].slot = other;
                error!(fd, %mask, "readiness for unregistered descriptor");
                return;
            }
        };

        if mask.is_error() {
            ep.handle_error(self);
        } else {
            if mask.is_readable() {
                ep.handle_read(self);
            }
            if mask.is_writable() && ep.meta().state != SocketState::Closing {
                ep.handle_write(self);
            }
        }
        self.checkin(idx, ep);
    }

    /// Shared receive scratch buffer. Endpoints borrow it with `mem::take`
    /// for the duration of one read and hand it back.
    pub(crate) fn take_scratch(&mut self) -> Vec<u8> {
        let mut buf = mem::take(&mut self.scratch);
        if buf.len() < self.config.max_read_size {
            buf.resize(self.config.max_read_size, 0);
        }
        buf
    }

    pub(crate) fn return_scratch(&mut self, buf: Vec<u8>) {
        self.scratch = buf;
    }

    fn drain_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        for ep in self.deferred.drain(..) {
            trace!(fd = ep.meta().fd, "destroying socket");
            drop(ep);
        }
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let len = self.entries.len();
        if self.count == 0 || len == 0 {
            return;
        }
        let batch = self.config.timeout_sweep_batch.min(len);
        for _ in 0..batch {
            let idx = self.sweep_cursor;
            self.sweep_cursor = (idx + 1) % len;
            if !matches!(self.entries[idx].slot, Slot::Occupied(_)) {
                continue;
            }
            if let Slot::Occupied(mut ep) = mem::replace(&mut self.entries[idx].slot, Slot::Busy) {
                ep.handle_timeout(self, now);
                self.checkin(idx, ep);
            }
        }
    }

    // ========================================================================
    // Slot helpers
    // ========================================================================

    fn index(&self, fd: RawFd) -> Result<usize> {
        if fd < 0 || fd as usize >= self.entries.len() {
            return Err(NetError::FdOutOfRange { fd, max: self.entries.len() });
        }
        Ok(fd as usize)
    }

    /// Index of `id` if it names a registered (possibly busy) endpoint.
    fn live_index(&self, id: SocketId) -> Result<usize> {
        let idx = self.index(id.fd).map_err(|_| NetError::NotRegistered { fd: id.fd })?;
        let entry = &self.entries[idx];
        match entry.slot {
            Slot::Occupied(_) | Slot::Busy if entry.generation == id.generation => Ok(idx),
            _ => Err(NetError::NotRegistered { fd: id.fd }),
        }
    }

    fn checkin(&mut self, idx: usize, mut ep: Box<dyn Endpoint>) {
        let entry = &mut self.entries[idx];
        match mem::replace(&mut entry.slot, Slot::Vacant) {
            Slot::Busy => entry.slot = Slot::Occupied(ep),
            Slot::Released => {
                ep.meta_mut().state = SocketState::Closing;
                self.deferred.push(ep);
            }
            other => {
                // Slot was reused while the endpoint was out; keep the new
                // occupant and retire this one.
                entry.slot = other;
                error!(fd = ep.meta().fd, "slot changed during callback");
                ep.meta_mut().state = SocketState::Closing;
                self.deferred.push(ep);
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        let open = self.count;
        self.drain_deferred();
        for entry in &mut self.entries {
            if let Slot::Occupied(ep) = mem::replace(&mut entry.slot, Slot::Vacant) {
                let _ = self.poller.del_interest(ep.meta().fd);
                drop(ep);
            }
        }
        if open > 0 {
            debug!(open, "reactor dropped with open sockets");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketType;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    /// Endpoint over one end of a socketpair that records callbacks.
    struct Recorder {
        meta: SocketMeta,
        log: Rc<RefCell<Vec<&'static str>>>,
        close_on_read: bool,
    }

    impl Recorder {
        fn new(fd: RawFd, log: Rc<RefCell<Vec<&'static str>>>) -> Box<Self> {
            Box::new(Self {
                meta: SocketMeta::new(fd, SocketType::Tcp, SocketState::Connected),
                log,
                close_on_read: false,
            })
        }
    }

    impl Endpoint for Recorder {
        fn meta(&self) -> &SocketMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut SocketMeta {
            &mut self.meta
        }
        fn handle_read(&mut self, reactor: &mut Reactor) {
            self.log.borrow_mut().push("read");
            if self.close_on_read {
                self.close(reactor);
            }
        }
        fn handle_write(&mut self, _reactor: &mut Reactor) {
            self.log.borrow_mut().push("write");
        }
        fn handle_error(&mut self, _reactor: &mut Reactor) {
            self.log.borrow_mut().push("error");
        }
        fn handle_timeout(&mut self, reactor: &mut Reactor, now: Instant) {
            if self.meta.is_idle(now) {
                self.log.borrow_mut().push("timeout");
                self.close(reactor);
            }
        }
        fn send_packet(&mut self, _reactor: &mut Reactor, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn close(&mut self, reactor: &mut Reactor) {
            if self.meta.state != SocketState::Closing {
                self.meta.state = SocketState::Closing;
                reactor.del_socket(self.meta.id());
                self.log.borrow_mut().push("close");
            }
        }
    }

    impl Drop for Recorder {
        fn drop(&mut self) {
            self.log.borrow_mut().push("drop");
            sys::close_fd(self.meta.fd);
        }
    }

    fn reactor() -> Reactor {
        Reactor::new(ReactorConfig::new().max_fds(1024).wait_timeout(Duration::from_millis(20))).unwrap()
    }

    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        sys::set_nonblocking(fds[0]).unwrap();
        sys::set_nonblocking(fds[1]).unwrap();
        (fds[0], fds[1])
    }

    #[test]
    fn test_registry_round_trip() {
        let mut r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = socket_pair();

        let id = r.add_socket(Recorder::new(a, log.clone()), Interest::READ_ERROR).unwrap();
        assert!(r.contains(id));
        assert_eq!(r.socket_count(), 1);
        assert_eq!(r.get(id).unwrap().interest, Interest::READ_ERROR);

        r.mod_socket(id, Interest::ALL).unwrap();
        assert_eq!(r.get(id).unwrap().interest, Interest::ALL);

        assert!(r.del_socket(id));
        assert!(!r.del_socket(id));
        assert!(!r.contains(id));
        assert_eq!(r.socket_count(), 0);
        assert!(matches!(r.mod_socket(id, Interest::READ), Err(NetError::NotRegistered { .. })));

        // Destruction waits for the next pass.
        assert_eq!(r.pending_close_count(), 1);
        assert!(!log.borrow().contains(&"drop"));
        r.dispatch().unwrap();
        assert_eq!(r.pending_close_count(), 0);
        assert_eq!(*log.borrow(), vec!["drop"]);
        sys::close_fd(b);
    }

    #[test]
    fn test_duplicate_and_out_of_range() {
        let mut r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = socket_pair();

        r.add_socket(Recorder::new(a, log.clone()), Interest::READ_ERROR).unwrap();
        let err = r.add_socket(Recorder::new(a, log.clone()), Interest::READ_ERROR).unwrap_err();
        assert_eq!(err, NetError::AlreadyRegistered { fd: a });
        assert_eq!(r.socket_count(), 1);

        let err = r.add_socket(Recorder::new(1_000_000, log.clone()), Interest::READ).unwrap_err();
        assert!(matches!(err, NetError::FdOutOfRange { fd: 1_000_000, .. }));

        // The registered endpoint still owns a working descriptor.
        assert_eq!(sys::send(b, b"x").unwrap(), 1);
        r.dispatch().unwrap();
        assert!(log.borrow().contains(&"read"));
        sys::close_fd(b);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = socket_pair();

        let first = r.add_socket(Recorder::new(a, log.clone()), Interest::READ_ERROR).unwrap();
        // Detach the fd from the first endpoint so it survives the drop.
        r.with_endpoint(first, |ep, _| ep.meta_mut().fd = -1).unwrap();
        // Deregister by hand: the poller knows the fd, not the endpoint's copy.
        assert!(r.del_socket(first));
        r.dispatch().unwrap();

        let second = r.add_socket(Recorder::new(a, log.clone()), Interest::READ_ERROR).unwrap();
        assert_eq!(second.fd, first.fd);
        assert_ne!(second.generation, first.generation);
        assert!(!r.contains(first));
        assert!(!r.del_socket(first));
        assert!(r.contains(second));
        sys::close_fd(b);
    }

    #[test]
    fn test_self_close_during_read_is_deferred() {
        let mut r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = socket_pair();
        let mut recorder = Recorder::new(a, log.clone());
        recorder.close_on_read = true;
        let id = r.add_socket(recorder, Interest::ALL).unwrap();

        assert_eq!(sys::send(b, b"x").unwrap(), 1);
        r.process_ready(a, Interest::READ | Interest::WRITE);

        // Closed inside read: no write callback, not dropped yet.
        assert_eq!(*log.borrow(), vec!["read", "close"]);
        assert!(!r.contains(id));
        assert_eq!(r.pending_close_count(), 1);

        r.dispatch().unwrap();
        assert_eq!(*log.borrow(), vec!["read", "close", "drop"]);
        sys::close_fd(b);
    }

    #[test]
    fn test_error_preempts_read_and_write() {
        let mut r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = socket_pair();
        r.add_socket(Recorder::new(a, log.clone()), Interest::ALL).unwrap();

        r.process_ready(a, Interest::ALL);
        assert_eq!(*log.borrow(), vec!["error"]);

        log.borrow_mut().clear();
        r.process_ready(a, Interest::READ | Interest::WRITE);
        assert_eq!(*log.borrow(), vec!["read", "write"]);
        sys::close_fd(b);
    }

    #[test]
    fn test_unknown_fd_is_skipped() {
        let mut r = reactor();
        r.process_ready(100, Interest::READ);
        r.process_ready(-1, Interest::READ);
        assert_eq!(r.socket_count(), 0);
    }

    #[test]
    fn test_busy_endpoint_rejects_reentry() {
        let mut r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = socket_pair();
        let id = r.add_socket(Recorder::new(a, log.clone()), Interest::READ_ERROR).unwrap();

        let inner = r.with_endpoint(id, |_, reactor| reactor.send_packet(id, b"x")).unwrap();
        assert_eq!(inner, Err(NetError::Busy { fd: a }));
        // Still registered and usable afterwards.
        assert!(r.send_packet(id, b"x").is_ok());
        sys::close_fd(b);
    }

    #[test]
    fn test_timeout_sweep_is_bounded() {
        let mut r = Reactor::new(
            ReactorConfig::new()
                .max_fds(1024)
                .timeout_sweep_batch(1)
                .wait_timeout(Duration::ZERO),
        )
        .unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = socket_pair();
        let id = r.add_socket(Recorder::new(a, log.clone()), Interest::READ_ERROR).unwrap();
        r.set_timeout(id, Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // One slot per pass: the cursor has to walk up to `a` first.
        for _ in 0..a {
            r.dispatch().unwrap();
        }
        assert!(log.borrow().is_empty());
        r.dispatch().unwrap();
        assert_eq!(*log.borrow(), vec!["timeout", "close"]);
        assert!(!r.contains(id));
        sys::close_fd(b);
    }
}

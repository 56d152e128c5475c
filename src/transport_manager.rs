//! Registers every transport the host reports, drives each through its own
//! [`TransportLoop`], demuxes mux frames off whichever one is active, and
//! picks the active transport on every state/authorization change (spec
//! §4.6).

use crate::host::{EngineListener, Host, Transport, TransportType};
use crate::logger::{self, BreadcrumbFlags};
use crate::muxer::{self, Flags};
use crate::pipe::PipeReader;
use crate::tcp_proxy::{DataPiece, TcpProxy};
use crate::transport_loop::{IncomingOutcome, LoopState, OutputStream, TransportLoop, TransportLoopListener};
use crate::udp_proxy::UdpProxy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Context {
    transport: Transport,
    loop_state: LoopState,
    authorized: bool,
    token: Option<String>,
    name: Option<String>,
    output: Option<OutputStream>,
    last_pong_time: Option<Instant>,
    handle: TransportLoop,
}

/// Selection-eligibility used by active-transport selection step 1 (spec
/// §4.6): handshaked AND authorized. `TEST` transports are implicitly
/// authorized (spec §3), matching the transmit-path gating below.
fn selection_eligible(loop_state: LoopState, authorized: bool, transport_type: TransportType) -> bool {
    loop_state == LoopState::Handshaked && (authorized || transport_type == TransportType::Test)
}

/// Transmit-path gating used by `send_tcp_data`/`send_udp_data` (spec §8
/// property 7): `TEST` transports bypass the authorization requirement.
fn frame_gating_allowed(authorized: bool, transport_type: TransportType) -> bool {
    authorized || transport_type == TransportType::Test
}

struct ActiveState {
    id: String,
    state: String,
}

struct Inner {
    contexts: Mutex<Vec<Context>>,
    active: Mutex<ActiveState>,
    tcp_proxy: Arc<TcpProxy>,
    udp_proxy: Arc<UdpProxy>,
    listener: Arc<dyn EngineListener>,
    device_type_id: String,
    /// RST-flagged UDP frames dropped instead of forwarded, tracked for
    /// diagnostics.
    udp_rst_dropped_total: AtomicU64,
}

pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    pub fn new(
        host: Arc<dyn Host>,
        tcp_proxy: Arc<TcpProxy>,
        udp_proxy: Arc<UdpProxy>,
        listener: Arc<dyn EngineListener>,
        device_type_id: String,
        backoff: Vec<Duration>,
    ) -> Self {
        let mut transports = host.get_transports();
        transports.sort_by_key(|t| t.transport_type);

        let inner = Arc::new(Inner {
            contexts: Mutex::new(Vec::new()),
            active: Mutex::new(ActiveState {
                id: String::new(),
                state: String::new(),
            }),
            tcp_proxy,
            udp_proxy,
            listener,
            device_type_id,
            udp_rst_dropped_total: AtomicU64::new(0),
        });

        {
            let mut contexts = inner.contexts.lock();
            for transport in transports {
                let context_listener: Arc<dyn TransportLoopListener> = Arc::new(ContextListener {
                    inner: Arc::clone(&inner),
                });
                let handle = TransportLoop::spawn(transport.id.clone(), Arc::clone(&host), context_listener, backoff.clone());
                contexts.push(Context {
                    transport,
                    loop_state: LoopState::Initialized,
                    authorized: false,
                    token: None,
                    name: None,
                    output: None,
                    last_pong_time: None,
                    handle,
                });
            }
        }

        let manager = Self { inner };
        manager.inner.reselect();
        manager
    }

    pub fn authorize_device(&self, token: &str, authorized: bool) {
        self.inner.authorize_device(token, authorized);
    }

    pub fn send_info(&self, token: &str, info_id: u32, info_text: &str) {
        self.inner.send_info(token, info_id, info_text);
    }

    pub fn send_tcp_data(&self, conn_id: u32, piece: DataPiece<'_>) {
        self.inner.send_tcp_data(conn_id, piece);
    }

    pub fn send_udp_data(&self, datagram_id: u64, datagram: &[u8]) {
        self.inner.send_udp_data(datagram_id, datagram);
    }

    pub fn active_transport(&self) -> (String, String) {
        let active = self.inner.active.lock();
        (active.id.clone(), active.state.clone())
    }

    /// RST-flagged UDP frames dropped so far (spec §4.6).
    pub fn udp_rst_dropped_total(&self) -> u64 {
        self.inner.udp_rst_dropped_total.load(Ordering::Relaxed)
    }

    /// Stops every transport loop. Each `Context`'s `TransportLoop` joins its
    /// threads on drop.
    pub fn shutdown(&self) {
        self.inner.contexts.lock().clear();
    }
}

struct ContextListener {
    inner: Arc<Inner>,
}

impl TransportLoopListener for ContextListener {
    fn on_loop_state_change(&self, transport_id: &str, state: LoopState) {
        self.inner.handle_loop_state_change(transport_id, state);
    }

    fn on_output_stream_ready(&self, transport_id: &str, writer: OutputStream) {
        self.inner.handle_output_ready(transport_id, writer);
    }

    fn on_incoming_data(&self, transport_id: &str, reader: &PipeReader) -> IncomingOutcome {
        self.inner.handle_incoming_data(transport_id, reader)
    }
}

impl Inner {
    fn handle_loop_state_change(&self, transport_id: &str, state: LoopState) {
        {
            let mut contexts = self.contexts.lock();
            if let Some(ctx) = contexts.iter_mut().find(|c| c.transport.id == transport_id) {
                ctx.loop_state = state;
                if state == LoopState::Disconnected {
                    ctx.authorized = false;
                    ctx.output = None;
                }
            }
        }
        self.reselect();
    }

    fn handle_output_ready(&self, transport_id: &str, writer: OutputStream) {
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.iter_mut().find(|c| c.transport.id == transport_id) {
            ctx.output = Some(writer);
        }
    }

    fn handle_incoming_data(&self, transport_id: &str, reader: &PipeReader) -> IncomingOutcome {
        let mut reader = reader.clone();
        let frame = match muxer::decode(&mut reader) {
            Ok(frame) => frame,
            Err(error) => {
                logger::warn(format!("transport_manager: frame decode failed for {transport_id}: {error}"));
                return IncomingOutcome::Abort;
            }
        };

        logger::breadcrumb(
            BreadcrumbFlags::TRANSPORT,
            format!("transport_manager: {transport_id} frame id={} flags={}", frame.id, muxer::flags_to_string(frame.flags)),
        );

        if frame.flags.contains(Flags::TCP) {
            if !frame.payload.is_empty() {
                self.tcp_proxy.send_response(frame.id, Some(&frame.payload));
            }
            if frame.flags.intersects(Flags::FIN | Flags::RST) {
                self.tcp_proxy.send_response(frame.id, None);
            }
            return IncomingOutcome::Continue;
        }

        if frame.flags.contains(Flags::UDP) {
            if frame.flags.contains(Flags::RST) {
                self.udp_rst_dropped_total.fetch_add(1, Ordering::Relaxed);
            } else {
                self.udp_proxy.send_reply(frame.id as u64, &frame.payload);
            }
            return IncomingOutcome::Continue;
        }

        if frame.flags.contains(Flags::AUTH) {
            if frame.flags.contains(Flags::FIN) {
                return IncomingOutcome::Continue; // unidirectional greeting, no reply.
            }
            return self.handle_auth(transport_id, &frame.payload);
        }

        if frame.flags.contains(Flags::INFO) {
            return self.handle_info(transport_id, &frame.payload);
        }

        if frame.flags.contains(Flags::PING) {
            let contexts = self.contexts.lock();
            if let Some(ctx) = contexts.iter().find(|c| c.transport.id == transport_id) {
                if let Some(output) = &ctx.output {
                    let _ = output.send(frame.id, Flags::PONG, &frame.payload);
                }
            }
            return IncomingOutcome::Continue;
        }

        if frame.flags.contains(Flags::PONG) {
            let mut contexts = self.contexts.lock();
            if let Some(ctx) = contexts.iter_mut().find(|c| c.transport.id == transport_id) {
                ctx.last_pong_time = Some(Instant::now());
            }
            return IncomingOutcome::Continue;
        }

        logger::debug(format!(
            "transport_manager: {transport_id} frame with no recognized flags ({})",
            muxer::flags_to_string(frame.flags)
        ));
        IncomingOutcome::Continue
    }

    /// `AUTH` without `FIN`: a real handshake challenge. Empty `token` or
    /// `name` is fatal for the transport (spec §9 design notes).
    fn handle_auth(&self, transport_id: &str, payload: &[u8]) -> IncomingOutcome {
        let headers = muxer::parse_headers(payload);
        let token = headers.get("token").cloned().unwrap_or_default();
        let name = headers.get("name").cloned().unwrap_or_default();
        if token.is_empty() || name.is_empty() {
            logger::warn(format!("transport_manager: malformed AUTH from {transport_id}, aborting transport"));
            return IncomingOutcome::Abort;
        }

        let output = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.iter_mut().find(|c| c.transport.id == transport_id) else {
                return IncomingOutcome::Abort;
            };
            ctx.token = Some(token.clone());
            ctx.name = Some(name.clone());
            ctx.output.clone()
        };

        if let Some(output) = output {
            let reply = muxer::format_headers([
                ("Version", "1"),
                ("RequiresMobileBridge", "true"),
                ("DTID", self.device_type_id.as_str()),
            ]);
            let _ = output.send(0, Flags::AUTH, reply.as_bytes());
        }

        self.listener.on_device_handshaked(transport_id, &token, &name);
        IncomingOutcome::Handshaked
    }

    /// `INFO`: periodic device telemetry. Same fatal-on-malformed-headers
    /// rule as `handle_auth` — an empty or missing `battery` or
    /// `connectivity` header aborts the transport rather than being ignored.
    fn handle_info(&self, transport_id: &str, payload: &[u8]) -> IncomingOutcome {
        let (authorized, token, output) = {
            let contexts = self.contexts.lock();
            match contexts.iter().find(|c| c.transport.id == transport_id) {
                Some(ctx) => (ctx.authorized, ctx.token.clone().unwrap_or_default(), ctx.output.clone()),
                None => return IncomingOutcome::Abort,
            }
        };
        if !authorized {
            return IncomingOutcome::Continue; // spec §8 S6: INFO before authorization is dropped silently.
        }

        let headers = muxer::parse_headers(payload);
        let battery = headers.get("battery").cloned().unwrap_or_default();
        let connectivity = headers.get("connectivity").cloned().unwrap_or_default();
        if battery.is_empty() || connectivity.is_empty() {
            logger::warn(format!("transport_manager: malformed INFO from {transport_id}, aborting transport"));
            return IncomingOutcome::Abort;
        }

        let json = format!("{{\"batteryLevel\":\"{battery}\",\"connectivityAvailable\":\"{connectivity}\"}}");
        self.listener.on_info(&token, 0, &json);

        if let Some(output) = output {
            let reply = muxer::format_headers([("RequiresMobileBridge", "true")]);
            let _ = output.send(0, Flags::INFO, reply.as_bytes());
        }
        IncomingOutcome::Continue
    }

    fn authorize_device(&self, token: &str, authorized: bool) {
        let changed = {
            let mut contexts = self.contexts.lock();
            let mut changed = false;
            for ctx in contexts.iter_mut() {
                if ctx.token.as_deref() == Some(token) && ctx.authorized != authorized {
                    ctx.authorized = authorized;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.reselect();
        }
    }

    /// Sends to every context whose token matches and that has a live
    /// output stream, not just the first — a token can be shared by more
    /// than one still-connecting transport during a handover.
    fn send_info(&self, token: &str, info_id: u32, info_text: &str) {
        let outputs: Vec<OutputStream> = {
            let contexts = self.contexts.lock();
            contexts
                .iter()
                .filter(|c| c.token.as_deref() == Some(token))
                .filter_map(|c| c.output.clone())
                .collect()
        };
        for output in outputs {
            let _ = output.send(info_id, Flags::INFO, info_text.as_bytes());
        }
    }

    fn send_tcp_data(&self, conn_id: u32, piece: DataPiece<'_>) {
        let output = {
            let contexts = self.contexts.lock();
            self.active_output(&contexts)
        };
        let Some(output) = output else { return };

        let mut flags = Flags::TCP;
        if piece.bytes_so_far == 0 {
            flags |= Flags::SYN;
        }
        let payload = piece.data.unwrap_or(&[]);
        if piece.data.is_none() || payload.is_empty() {
            flags |= Flags::FIN;
        }
        let _ = output.send(conn_id, flags, payload);
    }

    fn send_udp_data(&self, datagram_id: u64, datagram: &[u8]) {
        let output = {
            let contexts = self.contexts.lock();
            self.active_output(&contexts)
        };
        let Some(output) = output else { return };
        let _ = output.send(datagram_id as u32, Flags::UDP, datagram);
    }

    /// The active transport's output stream, or `None` if there isn't one or
    /// it isn't allowed to carry data frames yet (spec §8 property 7).
    fn active_output(&self, contexts: &[Context]) -> Option<OutputStream> {
        let active_id = self.active.lock().id.clone();
        if active_id.is_empty() {
            return None;
        }
        contexts
            .iter()
            .find(|c| c.transport.id == active_id)
            .filter(|c| frame_gating_allowed(c.authorized, c.transport.transport_type))
            .and_then(|c| c.output.clone())
    }

    /// Runs on every loop-state or authorization change (spec §4.6).
    fn reselect(&self) {
        let (new_id, new_state) = {
            let contexts = self.contexts.lock();
            if contexts.is_empty() {
                (String::new(), String::new())
            } else if let Some(candidate) = contexts.iter().find(|c| selection_eligible(c.loop_state, c.authorized, c.transport.transport_type)) {
                (candidate.transport.id.clone(), "AUTHORIZED".to_string())
            } else {
                let first = &contexts[0];
                (first.transport.id.clone(), first.loop_state.as_str().to_string())
            }
        };

        let mut active = self.active.lock();
        if active.id != new_id || active.state != new_state {
            active.id = new_id.clone();
            active.state = new_state.clone();
            drop(active);
            self.listener.on_active_transport_change(&new_id, &new_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_prefers_priority_order_among_eligible_contexts() {
        assert!(selection_eligible(LoopState::Handshaked, true, TransportType::Wifi));
        assert!(!selection_eligible(LoopState::Connected, true, TransportType::Wifi));
        assert!(!selection_eligible(LoopState::Handshaked, false, TransportType::Wifi));
    }

    #[test]
    fn handshaked_test_transport_is_selection_eligible_without_explicit_authorization() {
        assert!(selection_eligible(LoopState::Handshaked, false, TransportType::Test));
        assert!(!selection_eligible(LoopState::Connected, false, TransportType::Test));
    }

    #[test]
    fn gating_allows_test_transports_without_explicit_authorization() {
        assert!(frame_gating_allowed(false, TransportType::Test));
        assert!(!frame_gating_allowed(false, TransportType::Wifi));
        assert!(frame_gating_allowed(true, TransportType::Wifi));
    }
}

//! Channel 0: connection handshake and close.

use std::{ops::ControlFlow, sync::Arc, time::Duration};

use bytes::Bytes;
use tracing::{debug, info, trace};

use super::Channel;
use crate::{
    codec::{FRAME_MIN_SIZE, FrameType, WireFrame},
    connection::{ConnectionShared, ConnectionState},
    error::AmqpError,
    protocol::{
        Close,
        ConnectionStart,
        ConnectionStartOk,
        FieldTable,
        Method,
        ReplyCode,
        Tune,
        VERSION_MAJOR,
        VERSION_MINOR,
    },
};

/// Announce the server with `connection.start`.
pub(crate) async fn send_start(conn: &Arc<ConnectionShared>) {
    if let Err(e) = conn.advance(ConnectionState::AwaitingStartOk) {
        debug!("start not sent: connection_id={}, {e}", conn.id());
        return;
    }
    let config = conn.config();
    let server_properties = FieldTable::new()
        .with("product", config.product.as_str())
        .with("version", env!("CARGO_PKG_VERSION"))
        .with("platform", "Rust")
        .with("capabilities", FieldTable::new());
    let start = ConnectionStart {
        version_major: VERSION_MAJOR,
        version_minor: VERSION_MINOR,
        server_properties,
        mechanisms: config.mechanisms.clone(),
        locales: config.locales.clone(),
    };
    conn.send_method(0, Method::ConnectionStart(start)).await;
}

/// Zero from the client means "whatever the server offered".
fn negotiate<T: Copy + Default + Ord>(offer: T, requested: T) -> T {
    if requested == T::default() {
        offer
    } else if offer == T::default() {
        requested
    } else {
        offer.min(requested)
    }
}

fn handshaking(state: ConnectionState) -> bool {
    !state.is_open() && !state.is_closing()
}

impl Channel {
    pub(super) async fn handle_control(&mut self, frame: WireFrame) -> ControlFlow<()> {
        let state = self.conn.state();
        if frame.kind != FrameType::Method {
            if handshaking(state) {
                self.conn
                    .protocol_violation(&format!("{} frame on channel 0 during handshake", frame.kind));
                return ControlFlow::Break(());
            }
            if !state.is_closing() {
                let err = AmqpError::unexpected_frame(format!("{} frame on channel 0", frame.kind));
                self.conn.connection_error(err).await;
            }
            return ControlFlow::Continue(());
        }
        let method = match Method::decode(&frame.payload) {
            Ok(method) => method,
            Err(e) if handshaking(state) => {
                self.conn
                    .protocol_violation(&format!("undecodable handshake method: {e}"));
                return ControlFlow::Break(());
            }
            Err(_) if state.is_closing() => return ControlFlow::Continue(()),
            Err(e) => {
                self.conn.connection_error(e.into()).await;
                return ControlFlow::Continue(());
            }
        };
        self.on_control_method(method, state).await
    }

    async fn on_control_method(
        &mut self,
        method: Method,
        state: ConnectionState,
    ) -> ControlFlow<()> {
        let result = match (&method, state) {
            (Method::ConnectionClose(close), _) => return self.on_close(close).await,
            (Method::ConnectionCloseOk, ConnectionState::Closing) => {
                self.conn.hard_close("close handshake complete");
                return ControlFlow::Break(());
            }
            (_, state) if state.is_closing() => {
                trace!(
                    "channel 0 method discarded while closing: connection_id={}, method={:?}",
                    self.conn.id(),
                    method.ids()
                );
                return ControlFlow::Continue(());
            }
            (Method::ConnectionStartOk(start_ok), ConnectionState::AwaitingStartOk) => {
                self.on_start_ok(start_ok).await
            }
            (Method::ConnectionSecureOk { response }, ConnectionState::AwaitingSecureOk) => {
                self.on_secure_ok(response).await
            }
            (Method::ConnectionTuneOk(tune), ConnectionState::AwaitingTuneOk) => {
                self.on_tune_ok(*tune)
            }
            (Method::ConnectionOpen { virtual_host }, ConnectionState::AwaitingOpen) => {
                self.on_open(virtual_host).await
            }
            (_, ConnectionState::Open) => {
                let (class_id, method_id) = method.ids();
                Err(AmqpError::command_invalid(format!(
                    "method {class_id}.{method_id} is not valid on channel 0"
                )))
            }
            (_, state) => {
                let (class_id, method_id) = method.ids();
                self.conn.protocol_violation(&format!(
                    "method {class_id}.{method_id} out of order in state {state:?}"
                ));
                return ControlFlow::Break(());
            }
        };
        if let Err(err) = result {
            self.conn.connection_error(err.caused_by(&method)).await;
        }
        ControlFlow::Continue(())
    }

    fn advance(&self, to: ConnectionState) -> bool {
        match self.conn.advance(to) {
            Ok(()) => true,
            Err(e) => {
                debug!("handshake step skipped: connection_id={}, {e}", self.conn.id());
                false
            }
        }
    }

    async fn on_start_ok(&self, start_ok: &ConnectionStartOk) -> Result<(), AmqpError> {
        if !self.conn.config().accepts_mechanism(&start_ok.mechanism) {
            return Err(AmqpError::access_refused(format!(
                "unsupported mechanism '{}'",
                start_ok.mechanism
            )));
        }
        self.conn
            .set_client_properties(start_ok.client_properties.clone());
        debug!(
            "start-ok received: connection_id={}, mechanism={}, locale={}",
            self.conn.id(),
            start_ok.mechanism,
            start_ok.locale
        );
        if start_ok.response.is_empty() {
            if self.advance(ConnectionState::AwaitingSecureOk) {
                self.reply(Method::ConnectionSecure {
                    challenge: Bytes::new(),
                })
                .await;
            }
        } else if self.advance(ConnectionState::AwaitingTuneOk) {
            self.send_tune().await;
        }
        Ok(())
    }

    async fn on_secure_ok(&self, response: &Bytes) -> Result<(), AmqpError> {
        if response.is_empty() {
            return Err(AmqpError::access_refused("empty SASL response"));
        }
        if self.advance(ConnectionState::AwaitingTuneOk) {
            self.send_tune().await;
        }
        Ok(())
    }

    async fn send_tune(&self) {
        let offer = self.conn.tuning();
        self.reply(Method::ConnectionTune(offer)).await;
    }

    fn on_tune_ok(&self, requested: Tune) -> Result<(), AmqpError> {
        if requested.frame_max != 0 && requested.frame_max < FRAME_MIN_SIZE {
            return Err(AmqpError::new(
                ReplyCode::NotAllowed,
                format!(
                    "frame-max {} is below the minimum of {FRAME_MIN_SIZE}",
                    requested.frame_max
                ),
            ));
        }
        let offer = self.conn.tuning();
        let tuning = Tune {
            channel_max: negotiate(offer.channel_max, requested.channel_max),
            frame_max: negotiate(offer.frame_max, requested.frame_max),
            heartbeat: requested.heartbeat,
        };
        self.conn.set_tuning(tuning);
        if !self.advance(ConnectionState::AwaitingOpen) {
            return Ok(());
        }
        debug!(
            "connection tuned: connection_id={}, channel_max={}, frame_max={}, heartbeat={}",
            self.conn.id(),
            tuning.channel_max,
            tuning.frame_max,
            tuning.heartbeat
        );
        if tuning.heartbeat > 0 {
            self.conn
                .start_heartbeats(Duration::from_secs(u64::from(tuning.heartbeat)));
        }
        Ok(())
    }

    async fn on_open(&self, virtual_host: &str) -> Result<(), AmqpError> {
        if self.advance(ConnectionState::Open) {
            info!(
                "connection open: connection_id={}, virtual_host={virtual_host}",
                self.conn.id()
            );
            self.reply(Method::ConnectionOpenOk).await;
        }
        Ok(())
    }

    async fn on_close(&self, close: &Close) -> ControlFlow<()> {
        info!(
            "connection close requested: connection_id={}, reply_code={}, reply_text={}",
            self.conn.id(),
            close.reply_code,
            close.reply_text
        );
        if !self.conn.state().is_closing() {
            self.advance(ConnectionState::Closing);
        }
        self.reply(Method::ConnectionCloseOk).await;
        self.conn.close_after_flush().await;
        ControlFlow::Break(())
    }
}

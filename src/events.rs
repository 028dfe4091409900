//! Event bus shared by the Pairing Engine, the Upload Spool, and the
//! Control Socket Server.
//!
//! Components never write to a socket directly — they broadcast a
//! `GatewayEvent` and the control socket's subscription tables fan it out to
//! `MSG:`/`LOG:` frames on subscribed connections.

use tokio::sync::broadcast;

/// One asynchronous event. `Msg` carries the already-formatted `TAG[:arg]`
/// body of a `MSG:` frame (pairing events and upload/gateway broadcasts
/// share the one `PAIR-ENABLE`/`PAIR-DISABLE` subscription, per the
/// control-socket command surface). `Log` carries one formatted log line.
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    Msg(String),
    Log(String),
}

const CHANNEL_CAPACITY: usize = 256;

/// Create the shared broadcast channel. The sender is cloned into every
/// component that raises events; the control socket holds the single
/// receiver template and re-subscribes per connection.
pub fn channel() -> (broadcast::Sender<GatewayEvent>, broadcast::Receiver<GatewayEvent>) {
    broadcast::channel(CHANNEL_CAPACITY)
}

//! Health Monitor probe.

use tracing::{debug, info, warn};

use crate::engine::Context;

/// Ping the Remote Store under the configured deadline and publish the
/// result. Only transitions are logged.
pub(crate) async fn probe(ctx: &Context) -> bool {
    let result = ctx.remote_call(ctx.remote.ping()).await;
    let online = result.is_ok();

    if ctx.set_online(online) {
        match &result {
            Ok(()) => info!("Remote store connected (online)"),
            Err(e) => warn!("Remote store disconnected (offline): {e}"),
        }
    } else if let Err(e) = &result {
        debug!("Remote store still unreachable: {e}");
    }

    online
}

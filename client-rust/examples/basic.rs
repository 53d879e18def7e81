//! Basic beacon client example: print notifications for one user.
//!
//! ```bash
//! BEACON_URL=http://localhost:3000 BEACON_TOKEN=<jwt> \
//!     cargo run --example basic -- u1 w1
//! ```

use std::sync::Arc;

use serde_json::Value as JsonValue;

use beacon_client::{ChannelManager, ClientConfig, ConnectionState, Listener, ServerEvent};

#[tokio::main]
async fn main() -> Result<(), beacon_client::ClientError> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let user_id = args.next().unwrap_or_else(|| "u1".into());
    let workspace = args.next();

    let manager = Arc::new(ChannelManager::new(ClientConfig::from_env()?));

    let print: Listener = Arc::new(|payload: &JsonValue| println!("notification: {payload}"));
    manager.on(ServerEvent::Notification, Arc::clone(&print));
    manager.on(ServerEvent::WorkspaceInvitation, print);
    manager.on(
        ServerEvent::UrgentNotification,
        Arc::new(|payload: &JsonValue| println!("URGENT: {}", payload["message"])),
    );
    manager.on(
        ServerEvent::Error,
        Arc::new(|payload: &JsonValue| eprintln!("gateway error: {}", payload["message"])),
    );

    manager.initialize(user_id);
    if let Some(workspace) = workspace {
        // Recorded now, sent once connected.
        manager.join_workspace_channel(&workspace);
    }

    let mut state = manager.subscribe_state();
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        println!("state: {current:?}");
        if current == ConnectionState::Offline {
            break;
        }
    }

    manager.disconnect();
    Ok(())
}

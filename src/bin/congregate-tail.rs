//! Follow one account's conversations and notifications from the terminal.
//!
//! Connects to the event bus with the stored session (or one supplied on the
//! command line), mounts the conversation list and the notification engine,
//! and logs every reconciled change until Ctrl-C.

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use congregate::api::SocialApi;
use congregate::bus::EventBus;
use congregate::config::{Cli, Config};
use congregate::conversations::ConversationSync;
use congregate::http_api::HttpSocialApi;
use congregate::logging;
use congregate::models::{ConversationScope, UserProfile};
use congregate::notifications::NotificationEngine;
use congregate::session::SessionStore;
use congregate::ws_bus::WsEventBus;

fn parse_scope(scope: &str) -> Result<ConversationScope, Box<dyn Error>> {
    match scope {
        "principal" => Ok(ConversationScope::Principal),
        "pending" => Ok(ConversationScope::Pending),
        "archived" => Ok(ConversationScope::Archived),
        other => Err(format!("unknown scope {other:?} (principal, pending, archived)").into()),
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(e) = run().await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = Config::from_cli_and_env(Cli::parse());
    let scope = parse_scope(&config.scope)?;

    let session = Arc::new(SessionStore::open(&config.data_dir.join("session.db"))?);
    if let (Some(token), Some(user)) = (&config.token, &config.user) {
        session.save_login(
            token,
            &UserProfile {
                id: user.clone(),
                display_name: None,
                avatar_url: None,
            },
        )?;
    }
    let token = session
        .token()?
        .ok_or("no session: pass --token and --user once to log in")?;
    let profile = session
        .profile()?
        .ok_or("session has no cached profile: pass --user")?;
    info!(user = %logging::user_id(&profile.id), "session loaded");

    let api: Arc<dyn SocialApi> = Arc::new(HttpSocialApi::new(&config.sync.api_url, session.clone()));
    let ws = WsEventBus::connect(&config.sync, token);
    let bus: Arc<dyn EventBus> = ws.clone();

    let conversations = Arc::new(ConversationSync::new(api.clone(), bus.clone(), profile.id.clone()));
    let notifications = Arc::new(
        NotificationEngine::new(api.clone(), bus.clone()).with_poll_interval(config.sync.poll_interval),
    );

    let list = conversations.load_conversation_list(scope).await?;
    info!(scope = scope.as_str(), count = list.len(), "conversations loaded");
    let snapshot = notifications.mount().await?;
    info!(count = snapshot.len(), "notifications loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let conv_task = {
        let conversations = conversations.clone();
        let events = conversations.subscribe();
        tokio::spawn(async move { conversations.run(events).await })
    };
    let notif_task = {
        let notifications = notifications.clone();
        let events = notifications.subscribe();
        tokio::spawn(async move { notifications.run(events).await })
    };
    let poll_task = {
        let notifications = notifications.clone();
        tokio::spawn(async move { notifications.run_polling(shutdown_rx).await })
    };
    let report_task = {
        let conversations = conversations.clone();
        let notifications = notifications.clone();
        let mut auth = bus.auth_state();
        let mut logged_in = session.logged_in();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = auth.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let authenticated = *auth.borrow();
                        info!(authenticated, "event bus state");
                    }
                    changed = logged_in.changed() => {
                        if changed.is_err() || !*logged_in.borrow() {
                            error!("session ended by the server, log in again");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
                        let listed = conversations.conversations().await.len();
                        let unread_messages = conversations.total_unread().await;
                        let unread_notifications = notifications.unread_count().await;
                        info!(listed, unread_messages, unread_notifications, "status");
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        _ = report_task => {}
    }

    let _ = shutdown_tx.send(true);
    conversations.close().await;
    notifications.close().await;
    ws.shutdown();
    let _ = poll_task.await;
    conv_task.abort();
    notif_task.abort();
    Ok(())
}

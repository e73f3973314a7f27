use std::time::Duration;

use intel_exchange::client::models::article::classify;
use intel_exchange::client::models::session::Session;
use intel_exchange::client::services::connection::LinkState;
use intel_exchange::client::services::friends::FriendsApi;
use intel_exchange::client::services::http::MessagesApi;
use intel_exchange::client::utils::session_store;
use intel_exchange::{ApiClient, ClientConfig, ConnectionRegistry};

/// Manual smoke probe against a running backend:
/// `EXCHANGE_API_URL=http://127.0.0.1:8080 cargo run --bin exchange_probe alice bruno`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let me = args
        .next()
        .or_else(session_store::load_username)
        .unwrap_or_else(|| "alice".to_string());
    let friend = args.next().unwrap_or_else(|| "bruno".to_string());
    let session = Session::new(me);

    let cfg = ClientConfig::from_env();
    println!("API {} / WS {}", cfg.api_base_url, cfg.ws_url);

    let api = ApiClient::new(&cfg)?;
    let friends = api.friends(&session.username).await?;
    println!(
        "{} has {} friend(s): {:?}",
        session.username,
        friends.len(),
        friends.iter().map(|f| f.username.as_str()).collect::<Vec<_>>()
    );

    let history = api.history(&session.username, &friend).await?;
    println!("history with {}: {} message(s)", friend, history.len());

    let page = api.articles(&session.username, 1, 5).await?;
    println!(
        "{} article(s) on page 1 of {} total",
        page.data.len(),
        page.total_count
    );

    let bookmarks = api.favorites(&session.username).await?;
    for article in &bookmarks {
        println!(
            "bookmark: {} ({} risk)",
            article.title,
            classify(article).risk.as_str()
        );
    }

    let registry = ConnectionRegistry::new(cfg);
    let chat = registry.acquire_chat(&session.username).await;
    let mut events = chat.subscribe();
    let mut state = chat.watch_state();
    while *state.borrow() != LinkState::Open {
        state.changed().await?;
    }
    println!("chat link open");

    chat.send_chat(&friend, "probe message")?;
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Ok(frame)) => println!("received frame: {:?}", frame),
        Ok(Err(e)) => println!("event stream ended: {}", e),
        Err(_) => println!("no frame within 5s"),
    }

    let notify = registry.acquire_notifications(&session.username).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    for n in notify.snapshot().await {
        println!("notification: {}", n.message);
    }

    registry.release_chat().await;
    registry.release_notifications().await;
    if let Err(e) = session_store::save_username(&session.username) {
        log::warn!("could not remember user: {}", e);
    }
    Ok(())
}

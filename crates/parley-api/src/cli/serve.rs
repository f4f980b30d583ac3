//! `parley serve`: the listener endpoint.
//!
//! Starts the broadcast event loop, hosts the axum router on it and forwards
//! request lifecycle events from the bus to every connected listener. The
//! main thread keeps pumping marshaled events until the server stops.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use parley_core::broadcast::{Broadcaster, LoopDispatcher};
use parley_core::event::{EventBus, MarshalPump, SubscriptionId};
use parley_core::guard::or_fallback;
use parley_types::event::EventKind;

use crate::http::router::build_router;
use crate::state::AppState;

const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Event kinds pushed to remote listeners. Per-frame events stay local.
const FORWARDED: [EventKind; 7] = [
    EventKind::StreamFirstByte,
    EventKind::PlaybackStarted,
    EventKind::StreamEnd,
    EventKind::StreamError,
    EventKind::Error,
    EventKind::Status,
    EventKind::RequestFinished,
];

pub fn serve(
    state: &AppState,
    pump: Option<&MarshalPump>,
    host: String,
    port: u16,
    json: bool,
) -> Result<()> {
    let mut dispatcher =
        LoopDispatcher::spawn("parley-loop").context("failed to start event loop")?;
    let event_loop = dispatcher.handle();
    state.broadcaster.register_loop(event_loop.clone());

    let addr = format!("{host}:{port}");
    let bind_addr = addr.clone();
    let listener = event_loop
        .call(async move { tokio::net::TcpListener::bind(bind_addr).await })
        .context("event loop stopped before the listener was bound")?
        .with_context(|| format!("failed to bind {addr}"))?;
    let local = or_fallback(
        "serve",
        listener.local_addr().map(|a| a.to_string()),
        addr.clone(),
    );

    let forwarded = forward_to_listeners(&state.bus, &state.broadcaster);

    if json {
        println!("{}", serde_json::json!({ "listening": local }));
    } else {
        println!();
        println!(
            "  {} Parley listening on {}",
            style("▶").green().bold(),
            style(format!("http://{local}")).cyan()
        );
        println!("  Listeners: ws://{local}/ws/events");
        println!("  Press Ctrl+C to stop.");
        println!();
    }
    tracing::info!(addr = %local, "Listener endpoint started");

    let router = build_router(state.clone());
    let (done_tx, done_rx) = mpsc::channel();
    event_loop.spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        let _ = done_tx.send(result);
    });

    let result = loop {
        if let Some(pump) = pump {
            pump.pump();
        }
        match done_rx.recv_timeout(PUMP_INTERVAL) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };

    for (kind, id) in forwarded {
        state.bus.unsubscribe(kind, id);
    }
    dispatcher.shutdown();
    result.context("server error")?;

    if !json {
        println!("\n  Server stopped.");
    }
    Ok(())
}

/// Subscribe `broadcaster` to every forwarded event kind on `bus`.
fn forward_to_listeners(
    bus: &EventBus,
    broadcaster: &Broadcaster,
) -> Vec<(EventKind, SubscriptionId)> {
    FORWARDED
        .into_iter()
        .map(|kind| {
            let broadcaster = broadcaster.clone();
            let id = bus.subscribe(kind, move |event| broadcaster.send_event(event));
            (kind, id)
        })
        .collect()
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::broadcast::{Connection, ConnectionId};
    use parley_types::error::DeliveryFailure;
    use parley_types::event::ClientEvent;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        id: ConnectionId,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Connection for Recorder {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send_text(&self, message: &str) -> Result<(), DeliveryFailure> {
            self.seen.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    #[test]
    fn lifecycle_events_reach_listeners_but_frames_do_not() {
        let dispatcher = LoopDispatcher::spawn("test-loop").unwrap();
        let event_loop = dispatcher.handle();
        let broadcaster = Broadcaster::new(Duration::from_secs(1));
        assert!(broadcaster.register_loop(event_loop.clone()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            id: ConnectionId::new(),
            seen: seen.clone(),
        };
        let connector = broadcaster.clone();
        event_loop.call(async move { connector.connect(recorder) }).unwrap();

        let bus = EventBus::new();
        let forwarded = forward_to_listeners(&bus, &broadcaster);
        assert_eq!(forwarded.len(), FORWARDED.len());

        bus.publish(ClientEvent::StreamFrame { index: 0, len: 8 });
        bus.publish(ClientEvent::RequestFinished { success: true });
        // Jobs run in order, so this returns after the broadcast.
        event_loop.call(async {}).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let event: ClientEvent = serde_json::from_str(&seen[0]).unwrap();
        assert_eq!(event, ClientEvent::RequestFinished { success: true });
    }
}

/// Message bus task
///
/// Owns the one broker connection the engine publishes through. The tick task
/// never touches the network: it hands `OutboundMessage`s to a bounded queue
/// and reads commands back out of the shared FIFO. A broker outage therefore
/// degrades publishing but never stalls a tick.
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::services::commands::{self, CommandQueue};
use crate::services::publisher::{OutboundMessage, Publisher};

/// Engine-side outbound queue depth.
const OUTBOUND_QUEUE: usize = 256;

/// Per-publish deadline.
const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

/// Reconnect backoff bounds (s).
const BACKOFF_MIN_S: u64 = 1;
const BACKOFF_CAP_S: u64 = 60;

fn next_backoff(current_s: u64) -> u64 {
    (current_s * 2).min(BACKOFF_CAP_S)
}

#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<OutboundMessage>,
}

impl BusHandle {
    /// Queue a message without waiting. When the bus is down and the queue
    /// fills, state messages are dropped — they are retained or re-emitted
    /// next tick anyway, and staleness is what supervisors watch for.
    pub fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.tx.try_send(message) {
            debug!(error = %e, "outbound queue full, dropping publication");
        }
    }

    pub fn send_all(&self, messages: Vec<OutboundMessage>) {
        for message in messages {
            self.send(message);
        }
    }
}

/// Handle/receiver pair around the bounded outbound queue.
pub(crate) fn pair(capacity: usize) -> (BusHandle, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (BusHandle { tx }, rx)
}

/// Spawn the bus task. The handle feeds it; dropping every handle makes the
/// task flush, announce offline, and exit.
pub fn spawn(config: BusConfig, queue: Arc<CommandQueue>) -> (BusHandle, JoinHandle<()>) {
    let (handle, rx) = pair(OUTBOUND_QUEUE);
    let task = tokio::spawn(run(config, queue, rx));
    (handle, task)
}

async fn run(config: BusConfig, queue: Arc<CommandQueue>, mut rx: mpsc::Receiver<OutboundMessage>) {
    let publisher = Publisher::new(&config.topic_prefix, &config.discovery_prefix);
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("solar-heating-{}", uuid::Uuid::new_v4()));

    info!(
        host = %config.host,
        port = config.port,
        client_id = %client_id,
        "connecting to message bus"
    );

    let mut options = MqttOptions::new(&client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        publisher.availability_topic(),
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
        options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let mut backoff_s = BACKOFF_MIN_S;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => publish(&client, message).await,
                    // Engine gone: flush, say goodbye, stop.
                    None => break,
                }
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("bus connected");
                        backoff_s = BACKOFF_MIN_S;
                        // Subscriptions do not survive clean sessions, so
                        // re-issue on every (re)connect.
                        if let Err(e) = client
                            .subscribe(publisher.command_filter(), QoS::AtLeastOnce)
                            .await
                        {
                            warn!(error = %e, "command subscription failed");
                        }
                        publish(&client, publisher.availability(true)).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        handle_inbound(&client, &publisher, &queue, &p.topic, &p.payload).await;
                    }
                    Ok(_) => {
                        backoff_s = BACKOFF_MIN_S;
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in_s = backoff_s, "bus connection error");
                        tokio::time::sleep(Duration::from_secs(backoff_s)).await;
                        backoff_s = next_backoff(backoff_s);
                    }
                }
            }
        }
    }

    let _ = client
        .publish(publisher.availability_topic(), QoS::AtLeastOnce, true, "offline")
        .await;
    // Give the event loop a moment to flush the farewell.
    for _ in 0..10 {
        match tokio::time::timeout(Duration::from_millis(100), eventloop.poll()).await {
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    info!("bus task stopped");
}

async fn publish(client: &AsyncClient, message: OutboundMessage) {
    let qos = if message.wants_ack() { QoS::AtLeastOnce } else { QoS::AtMostOnce };
    let OutboundMessage { topic, payload, retained } = message;
    let attempt = client.publish(topic.clone(), qos, retained, payload);
    match tokio::time::timeout(PUBLISH_DEADLINE, attempt).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(topic = %topic, error = %e, "publish failed"),
        Err(_) => warn!(topic = %topic, "publish deadline exceeded"),
    }
}

/// Parse an inbound control message and enqueue it, or publish a nack. The
/// control topics are free-form text by contract, so there is no JSON parsing
/// here to warn about; only genuinely unknown topics and bad values nack.
async fn handle_inbound(
    client: &AsyncClient,
    publisher: &Publisher,
    queue: &CommandQueue,
    topic: &str,
    payload: &[u8],
) {
    let Some(suffix) = publisher.strip_prefix(topic) else {
        return;
    };
    let text = String::from_utf8_lossy(payload);

    match commands::parse_inbound(suffix, &text) {
        Ok(command) => {
            debug!(?command, "command accepted");
            queue.push(command);
        }
        Err(e) => {
            warn!(topic = %suffix, error = %e, "command rejected");
            let nack = serde_json::json!({
                "kind": "COMMAND_REJECTED",
                "severity": "WARNING",
                "topic": suffix,
                "detail": e.to_string(),
            });
            let _ = client
                .publish(publisher.alert_topic("command"), QoS::AtLeastOnce, false, nack.to_string())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut s = BACKOFF_MIN_S;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(s);
            s = next_backoff(s);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = BusHandle { tx };
        let msg = OutboundMessage {
            topic: "t".to_string(),
            payload: "p".to_string(),
            retained: false,
        };
        handle.send(msg.clone());
        // The queue is full now; this must return immediately.
        handle.send(msg);
    }
}

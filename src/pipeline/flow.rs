use log::{error, info};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval_at};

use super::retry;
use crate::connectors::{Destination, MessageStream, Source};
use crate::shutdown::Interrupt;
use crate::stats::PipelineStats;
use crate::transform::Transformer;

/// Moves messages from one source to one destination.
///
/// DESIGN:
/// - One delivery task, single consumer, source order preserved
/// - Best effort, at most once: every message is written once, failures
///   are logged and the loop moves on
/// - Connecting is fail-fast: an interrupt while connecting ends the
///   process instead of returning
///
/// The delivery task is not joined on shutdown; a write in flight when
/// the interrupt arrives may or may not complete.
pub struct Flow {
    source: Arc<dyn Source>,
    transformer: Option<Arc<dyn Transformer>>,
    destination: Arc<dyn Destination>,
    stats: Arc<PipelineStats>,
    stats_every: Option<Duration>,
}

impl Flow {
    pub fn new(source: Arc<dyn Source>, destination: Arc<dyn Destination>) -> Self {
        Self {
            source,
            transformer: None,
            destination,
            stats: Arc::new(PipelineStats::new()),
            stats_every: None,
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Logs the pipeline counters every `every`.
    pub fn with_stats_every(mut self, every: Duration) -> Self {
        self.stats_every = Some(every);
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Installs the SIGINT/SIGTERM handler, then runs until it fires.
    ///
    /// Returns the number of delivered messages.
    pub async fn run(self) -> anyhow::Result<u64> {
        let interrupt = Interrupt::install()?;
        Ok(self.run_until(interrupt).await)
    }

    /// Runs the pipeline until `interrupt` fires.
    ///
    /// Exits the process with status 1 if the interrupt fires while
    /// connecting, or if the source cannot start reading.
    pub async fn run_until(self, interrupt: Interrupt) -> u64 {
        // --------------------------------------------------------
        // Connect (source first)
        // --------------------------------------------------------
        retry::connect_or_exit("source", || self.source.connect(), &interrupt).await;
        retry::connect_or_exit("destination", || self.destination.connect(), &interrupt).await;

        info!("Source is: {}", self.source.name());
        self.source.info();
        info!("Destination is: {}", self.destination.name());
        self.destination.info();
        if let Some(transformer) = &self.transformer {
            info!("Transformer is: {}", transformer.name());
            transformer.info();
        }

        // --------------------------------------------------------
        // Delivery task (detached)
        // --------------------------------------------------------
        let delivery = tokio::spawn({
            let source = self.source.clone();
            let transformer = self.transformer.clone();
            let destination = self.destination.clone();
            let stats = self.stats.clone();

            async move {
                let messages = match source.read().await {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!("source.read(): {}", e);
                        std::process::exit(1);
                    }
                };

                info!("Flowing data...");
                deliver(messages, transformer.as_deref(), destination.as_ref(), &stats).await;
                info!("source stream ended");
            }
        });

        let reporter = self
            .stats_every
            .map(|every| spawn_reporter(self.stats.clone(), every));

        // --------------------------------------------------------
        // Shutdown
        // --------------------------------------------------------
        interrupt.wait().await;
        info!("Interrupt received.");

        let delivered = self.stats.delivered();
        info!("Sent messages: {}", delivered);

        if let Some(reporter) = reporter {
            reporter.abort();
        }

        if let Err(e) = self.source.disconnect().await {
            error!("source disconnect failed: {}", e);
        }
        if let Err(e) = self.destination.disconnect().await {
            error!("destination disconnect failed: {}", e);
        }

        drop(delivery);
        delivered
    }
}

/// The delivery loop: transform, write, count.
///
/// Returns when `messages` ends.
pub async fn deliver(
    mut messages: MessageStream,
    transformer: Option<&dyn Transformer>,
    destination: &dyn Destination,
    stats: &PipelineStats,
) {
    while let Some(message) = messages.recv().await {
        let outgoing = match transformer {
            Some(transformer) => match transformer.transform(&message) {
                Ok(transformed) => transformed,
                Err(e) => {
                    // fall back to the original message
                    stats.record_transform_error();
                    error!("Failed to transform message: {}", e);
                    message
                }
            },
            None => message,
        };

        match destination.write(outgoing).await {
            Ok(()) => stats.record_delivered(),
            Err(e) => {
                stats.record_write_error();
                error!("write failed: {}", e);
            }
        }
    }
}

fn spawn_reporter(stats: Arc<PipelineStats>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            ticker.tick().await;
            info!(
                "[STATS] delivered={} write_err={} transform_err={}",
                stats.delivered(),
                stats.write_errors(),
                stats.transform_errors(),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{Connector, Message};
    use crate::error::{ConnectionError, TransformError, WriteError};
    use crate::shutdown;
    use crate::transform::JsonAppend;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    /// Emits a fixed list of messages, then ends the stream.
    #[derive(Default)]
    struct VecSource {
        messages: Vec<Message>,
        connect_failures: AtomicU32,
        connect_attempts: AtomicU32,
        disconnected: AtomicBool,
    }

    impl VecSource {
        fn new(messages: &[&str]) -> Self {
            Self {
                messages: messages.iter().map(|m| m.to_string()).collect(),
                ..Default::default()
            }
        }

        fn failing_connects(self, n: u32) -> Self {
            self.connect_failures.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait::async_trait]
    impl Connector for VecSource {
        fn name(&self) -> &'static str {
            "vec"
        }

        async fn connect(&self) -> Result<(), ConnectionError> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            Ok(())
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.disconnected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn info(&self) {}
    }

    #[async_trait::async_trait]
    impl Source for VecSource {
        async fn read(&self) -> Result<MessageStream, ConnectionError> {
            let (tx, rx) = mpsc::unbounded_channel();
            for m in &self.messages {
                let _ = tx.send(m.clone());
            }
            Ok(rx)
        }
    }

    /// Records every write attempt; rejects messages equal to `reject`.
    #[derive(Default)]
    struct CaptureDestination {
        reject: Option<Message>,
        attempts: Mutex<Vec<Message>>,
        accepted: Mutex<Vec<Message>>,
        disconnected: AtomicBool,
    }

    impl CaptureDestination {
        fn accepted(&self) -> Vec<Message> {
            self.accepted.lock().unwrap().clone()
        }

        fn attempts(&self) -> Vec<Message> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Connector for CaptureDestination {
        fn name(&self) -> &'static str {
            "capture"
        }

        async fn connect(&self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.disconnected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn info(&self) {}
    }

    #[async_trait::async_trait]
    impl Destination for CaptureDestination {
        async fn write(&self, message: Message) -> Result<(), WriteError> {
            self.attempts.lock().unwrap().push(message.clone());
            if self.reject.as_ref() == Some(&message) {
                return Err(WriteError::Io(std::io::Error::other("rejected")));
            }
            self.accepted.lock().unwrap().push(message);
            Ok(())
        }
    }

    /// Uppercases everything except "bad".
    struct Picky;

    impl Transformer for Picky {
        fn name(&self) -> &'static str {
            "picky"
        }

        fn transform(&self, message: &str) -> Result<Message, TransformError> {
            if message == "bad" {
                return Err(TransformError::NotAnObject("string"));
            }
            Ok(message.to_uppercase())
        }

        fn info(&self) {}
    }

    fn stream_of(messages: &[&str]) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        for m in messages {
            tx.send(m.to_string()).unwrap();
        }
        rx
    }

    /// Fires the interrupt once `dest` has accepted `n` messages.
    fn interrupt_after(dest: Arc<CaptureDestination>, n: usize) -> Interrupt {
        let (trigger, interrupt) = shutdown::channel();
        tokio::spawn(async move {
            loop {
                let seen = dest.accepted.lock().unwrap().len();
                if seen >= n {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
            trigger.trigger();
        });
        interrupt
    }

    #[tokio::test]
    async fn counts_every_successful_write() {
        let dest = CaptureDestination::default();
        let stats = PipelineStats::new();
        let messages: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = messages.iter().map(String::as_str).collect();

        deliver(stream_of(&refs), None, &dest, &stats).await;

        assert_eq!(stats.delivered(), 50);
        assert_eq!(dest.accepted(), messages);
    }

    #[tokio::test]
    async fn failed_transform_forwards_original_once() {
        let dest = CaptureDestination::default();
        let stats = PipelineStats::new();

        deliver(stream_of(&["a", "bad", "c"]), Some(&Picky as &dyn Transformer), &dest, &stats).await;

        assert_eq!(dest.attempts(), vec!["A", "bad", "C"]);
        assert_eq!(stats.delivered(), 3);
        assert_eq!(stats.transform_errors(), 1);
    }

    #[tokio::test]
    async fn failed_write_is_not_retried() {
        let dest = CaptureDestination {
            reject: Some("b".to_string()),
            ..Default::default()
        };
        let stats = PipelineStats::new();

        deliver(stream_of(&["a", "b", "c"]), None, &dest, &stats).await;

        assert_eq!(dest.attempts(), vec!["a", "b", "c"]);
        assert_eq!(dest.accepted(), vec!["a", "c"]);
        assert_eq!(stats.delivered(), 2);
        assert_eq!(stats.write_errors(), 1);
    }

    #[tokio::test]
    async fn end_to_end_without_transformer() {
        let source = Arc::new(VecSource::new(&["a", "b", "c"]));
        let dest = Arc::new(CaptureDestination::default());

        let flow = Flow::new(source.clone(), dest.clone());
        let stats = flow.stats();
        let delivered = flow.run_until(interrupt_after(dest.clone(), 3)).await;

        assert_eq!(dest.accepted(), vec!["a", "b", "c"]);
        assert_eq!(delivered, 3);
        assert_eq!(stats.delivered(), 3);
        assert!(source.disconnected.load(Ordering::SeqCst));
        assert!(dest.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn end_to_end_with_json_transformer() {
        let source = Arc::new(VecSource::new(&[r#"{"x":1}"#]));
        let dest = Arc::new(CaptureDestination::default());

        let delivered = Flow::new(source, dest.clone())
            .with_transformer(Arc::new(JsonAppend::new().with_field("k", "v")))
            .with_stats_every(Duration::from_millis(10))
            .run_until(interrupt_after(dest.clone(), 1))
            .await;

        assert_eq!(delivered, 1);
        let out: Value = serde_json::from_str(&dest.accepted()[0]).unwrap();
        assert_eq!(out, json!({"x": 1, "k": "v"}));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_are_retried() {
        let source = Arc::new(VecSource::new(&["a", "b", "c"]).failing_connects(2));
        let dest = Arc::new(CaptureDestination::default());

        let start = Instant::now();
        let delivered = Flow::new(source.clone(), dest.clone())
            .run_until(interrupt_after(dest.clone(), 3))
            .await;

        assert_eq!(delivered, 3);
        assert_eq!(source.connect_attempts.load(Ordering::SeqCst), 3);
        // waited 2s then 4s
        assert!(Instant::now() - start >= Duration::from_secs(6));
    }
}

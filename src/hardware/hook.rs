use crate::call::CallInput;
use crate::gpio::{Edge, GpioError, GpioPort, Level, Pull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    OnHook,
    OffHook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Pickup,
    Hangup,
}

/// Watches the hook switch. The line is pulled high: high means the handset
/// rests in the cradle, low means it has been lifted.
///
/// Debouncing defers confirmation instead of assuming a bounce-burst length:
/// every edge re-arms a one-shot; when it finally fires the line is sampled,
/// and only a sampled level that differs from the last confirmed one emits an
/// event. Arbitrarily long chatter is absorbed at the cost of one debounce
/// interval of latency.
pub struct HookMonitor {
    gpio: Arc<dyn GpioPort>,
    pin: u8,
    debounce: Duration,
    queue: mpsc::UnboundedSender<CallInput>,
    token: CancellationToken,
    off_hook: Arc<AtomicBool>,
}

impl HookMonitor {
    pub fn new(
        gpio: Arc<dyn GpioPort>,
        pin: u8,
        debounce: Duration,
        queue: mpsc::UnboundedSender<CallInput>,
        token: CancellationToken,
    ) -> Self {
        Self {
            gpio,
            pin,
            debounce,
            queue,
            token,
            off_hook: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The last confirmed hook state.
    pub fn state(&self) -> HookState {
        if self.off_hook.load(Ordering::SeqCst) {
            HookState::OffHook
        } else {
            HookState::OnHook
        }
    }

    /// Handle for components that only need the snapshot.
    pub fn state_handle(&self) -> HookStateHandle {
        HookStateHandle {
            off_hook: self.off_hook.clone(),
        }
    }

    pub fn start(&self) -> Result<(), GpioError> {
        self.gpio.configure_input(self.pin, Pull::Up)?;

        let initial = self.gpio.read(self.pin)?;
        self.off_hook.store(initial == Level::Low, Ordering::SeqCst);
        info!(pin = self.pin, state = ?self.state(), "hook monitor started");

        let (edge_tx, edge_rx) = mpsc::unbounded_channel();
        self.gpio.on_edge(
            self.pin,
            Edge::Both,
            Box::new(move |_| {
                edge_tx.send(()).ok();
            }),
        )?;

        let gpio = self.gpio.clone();
        let pin = self.pin;
        let debounce = self.debounce;
        let queue = self.queue.clone();
        let token = self.token.clone();
        let off_hook = self.off_hook.clone();
        tokio::spawn(async move {
            run_loop(gpio, pin, debounce, edge_rx, queue, off_hook, token).await;
            debug!(pin, "hook monitor stopped");
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.token.cancel();
        self.gpio.remove_handler(self.pin).ok();
    }
}

#[derive(Clone)]
pub struct HookStateHandle {
    off_hook: Arc<AtomicBool>,
}

impl HookStateHandle {
    pub fn state(&self) -> HookState {
        if self.off_hook.load(Ordering::SeqCst) {
            HookState::OffHook
        } else {
            HookState::OnHook
        }
    }
}

async fn run_loop(
    gpio: Arc<dyn GpioPort>,
    pin: u8,
    debounce: Duration,
    mut edge_rx: mpsc::UnboundedReceiver<()>,
    queue: mpsc::UnboundedSender<CallInput>,
    off_hook: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            edge = edge_rx.recv() => {
                match edge {
                    // Every edge pushes confirmation out again.
                    Some(()) => deadline = Some(Instant::now() + debounce),
                    None => break,
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                let level = match gpio.read(pin) {
                    Ok(level) => level,
                    Err(e) => {
                        tracing::error!(pin, "hook sample failed: {}", e);
                        continue;
                    }
                };
                let sampled_off_hook = level == Level::Low;
                if sampled_off_hook != off_hook.load(Ordering::SeqCst) {
                    off_hook.store(sampled_off_hook, Ordering::SeqCst);
                    let event = if sampled_off_hook {
                        HookEvent::Pickup
                    } else {
                        HookEvent::Hangup
                    };
                    info!(pin, ?event, "hook state confirmed");
                    if queue.send(CallInput::Hook(event)).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::MockGpio;

    const PIN: u8 = 17;
    const DEBOUNCE: Duration = Duration::from_millis(50);

    struct Fixture {
        gpio: Arc<MockGpio>,
        monitor: HookMonitor,
        queue: mpsc::UnboundedReceiver<CallInput>,
    }

    fn fixture() -> Fixture {
        let gpio = Arc::new(MockGpio::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = HookMonitor::new(
            gpio.clone(),
            PIN,
            DEBOUNCE,
            tx,
            CancellationToken::new(),
        );
        monitor.start().unwrap();
        Fixture {
            gpio,
            monitor,
            queue: rx,
        }
    }

    async fn expect_hook(queue: &mut mpsc::UnboundedReceiver<CallInput>) -> HookEvent {
        match queue.recv().await {
            Some(CallInput::Hook(ev)) => ev,
            other => panic!("expected hook event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pickup_confirmed_after_debounce() {
        let mut f = fixture();
        assert_eq!(f.monitor.state(), HookState::OnHook);

        f.gpio.set_level(PIN, Level::Low);
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(expect_hook(&mut f.queue).await, HookEvent::Pickup);
        assert_eq!(f.monitor.state(), HookState::OffHook);
        f.monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounce_shorter_than_debounce_produces_nothing() {
        let mut f = fixture();

        // A burst of chatter that ends back where it started.
        for _ in 0..4 {
            f.gpio.set_level(PIN, Level::Low);
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.gpio.set_level(PIN, Level::High);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert!(f.queue.try_recv().is_err());
        assert_eq!(f.monitor.state(), HookState::OnHook);
        f.monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bouncy_pickup_emits_single_event() {
        let mut f = fixture();

        // Chatter that settles low: one pickup, not four.
        for _ in 0..4 {
            f.gpio.set_level(PIN, Level::Low);
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.gpio.set_level(PIN, Level::High);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.gpio.set_level(PIN, Level::Low);
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(expect_hook(&mut f.queue).await, HookEvent::Pickup);
        assert!(f.queue.try_recv().is_err());
        f.monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pickup_then_hangup() {
        let mut f = fixture();

        f.gpio.set_level(PIN, Level::Low);
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(expect_hook(&mut f.queue).await, HookEvent::Pickup);

        f.gpio.set_level(PIN, Level::High);
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(expect_hook(&mut f.queue).await, HookEvent::Hangup);
        assert_eq!(f.monitor.state(), HookState::OnHook);
        f.monitor.stop();
    }
}

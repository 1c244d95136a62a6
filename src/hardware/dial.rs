use crate::call::CallInput;
use crate::gpio::{Edge, GpioError, GpioPort, Pull};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Decodes rotary pulses into digits.
///
/// The dial interrupts the loop on its way back to rest: one transient low
/// per pulse, N pulses for digit N, ten for 0. Falling edges accumulate in a
/// counter; once the line has been quiet for the pulse timeout the count is
/// folded through `% 10` and emitted. Implausible counts are not suppressed
/// here, the dialling policy decides what to do with a bad number.
pub struct DialReader {
    gpio: Arc<dyn GpioPort>,
    pin: u8,
    pulse_timeout: Duration,
    queue: mpsc::UnboundedSender<CallInput>,
    token: CancellationToken,
}

impl DialReader {
    pub fn new(
        gpio: Arc<dyn GpioPort>,
        pin: u8,
        pulse_timeout: Duration,
        queue: mpsc::UnboundedSender<CallInput>,
        token: CancellationToken,
    ) -> Self {
        Self {
            gpio,
            pin,
            pulse_timeout,
            queue,
            token,
        }
    }

    /// Configure the pulse pin and start decoding. The edge handler only
    /// timestamps into a channel; counting happens on the reader task so the
    /// notification context never blocks.
    pub fn start(&self) -> Result<(), GpioError> {
        self.gpio.configure_input(self.pin, Pull::Up)?;

        let (edge_tx, edge_rx) = mpsc::unbounded_channel();
        self.gpio.on_edge(
            self.pin,
            Edge::Falling,
            Box::new(move |_| {
                edge_tx.send(()).ok();
            }),
        )?;

        let token = self.token.clone();
        let queue = self.queue.clone();
        let pulse_timeout = self.pulse_timeout;
        let pin = self.pin;
        tokio::spawn(async move {
            run_loop(edge_rx, queue, pulse_timeout, token).await;
            debug!(pin, "dial reader stopped");
        });

        info!(pin = self.pin, timeout = ?self.pulse_timeout, "dial reader started");
        Ok(())
    }

    pub fn stop(&self) {
        self.token.cancel();
        self.gpio.remove_handler(self.pin).ok();
    }
}

async fn run_loop(
    mut edge_rx: mpsc::UnboundedReceiver<()>,
    queue: mpsc::UnboundedSender<CallInput>,
    pulse_timeout: Duration,
    token: CancellationToken,
) {
    let mut count: u32 = 0;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            edge = edge_rx.recv() => {
                match edge {
                    Some(()) => {
                        count += 1;
                        deadline = Some(Instant::now() + pulse_timeout);
                        debug!(count, "pulse");
                    }
                    None => break,
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let digit = char::from_digit(count % 10, 10).unwrap_or('0');
                info!(digit = %digit, pulses = count, "digit decoded");
                count = 0;
                deadline = None;
                if queue.send(CallInput::Digit(digit)).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{Level, MockGpio};
    use std::time::Duration;

    const PIN: u8 = 27;
    const PULSE_TIMEOUT: Duration = Duration::from_millis(300);

    struct Fixture {
        gpio: Arc<MockGpio>,
        reader: DialReader,
        queue: mpsc::UnboundedReceiver<CallInput>,
    }

    fn fixture() -> Fixture {
        let gpio = Arc::new(MockGpio::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = DialReader::new(
            gpio.clone(),
            PIN,
            PULSE_TIMEOUT,
            tx,
            CancellationToken::new(),
        );
        reader.start().unwrap();
        Fixture {
            gpio,
            reader,
            queue: rx,
        }
    }

    async fn dial(gpio: &MockGpio, pulses: u32) {
        for _ in 0..pulses {
            gpio.pulse(PIN, Duration::from_millis(33), Duration::from_millis(66))
                .await;
        }
    }

    async fn expect_digit(queue: &mut mpsc::UnboundedReceiver<CallInput>) -> char {
        match queue.recv().await {
            Some(CallInput::Digit(d)) => d,
            other => panic!("expected digit, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_pulses_decode_digit_three() {
        let mut f = fixture();
        dial(&f.gpio, 3).await;
        tokio::time::sleep(PULSE_TIMEOUT * 2).await;
        assert_eq!(expect_digit(&mut f.queue).await, '3');
        f.reader.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_pulses_decode_zero() {
        let mut f = fixture();
        dial(&f.gpio, 10).await;
        tokio::time::sleep(PULSE_TIMEOUT * 2).await;
        assert_eq!(expect_digit(&mut f.queue).await, '0');
        f.reader.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_digits_stay_separate() {
        let mut f = fixture();
        dial(&f.gpio, 2).await;
        tokio::time::sleep(PULSE_TIMEOUT * 2).await;
        dial(&f.gpio, 5).await;
        tokio::time::sleep(PULSE_TIMEOUT * 2).await;
        assert_eq!(expect_digit(&mut f.queue).await, '2');
        assert_eq!(expect_digit(&mut f.queue).await, '5');
        f.reader.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pulses_no_digit() {
        let mut f = fixture();
        tokio::time::sleep(PULSE_TIMEOUT * 4).await;
        assert!(f.queue.try_recv().is_err());
        f.reader.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rising_edges_are_not_counted() {
        let mut f = fixture();
        // One full pulse produces exactly one count even though the line
        // transitions twice.
        f.gpio.set_level(PIN, Level::Low);
        tokio::time::sleep(Duration::from_millis(33)).await;
        f.gpio.set_level(PIN, Level::High);
        tokio::time::sleep(PULSE_TIMEOUT * 2).await;
        assert_eq!(expect_digit(&mut f.queue).await, '1');
        f.reader.stop();
    }
}

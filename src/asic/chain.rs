//! BM13xx chain driver.
//!
//! Owns the serial link to the daisy-chained chips: hardware reset,
//! enumeration, addressing, register configuration, PLL ramp-up, job
//! transmit, and result receive. The transport is a `Stream`/`Sink` of
//! decoded frames, so the same driver runs over the real UART or an
//! in-memory duplex in tests.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{sleep, timeout};
use tokio_serial::SerialStream;
use tokio_util::codec::Framed;

use super::error::ChainError;
use super::protocol::{
    difficulty_mask_value, largest_power_of_two, version_mask_value, Command, FrameCodec, JobFrame,
    JobPayload, PllDividers, RegisterAddress, Response, ResultFrame, STRATUM_DEFAULT_VERSION_MASK,
};
use super::{AsicModel, JobFormat};
use crate::job::AsicJob;
use crate::tracing::prelude::*;

/// Host UART baud until the chips are reprogrammed.
///
/// The chips power up with divider 26, which computes to
/// 25_000_000 / ((26 + 1) * 8) = 115_740 bps on the wire; the conventional
/// figure for this setting is 115_749 and hosts have always opened the port
/// with that value, so we keep it.
pub const INITIAL_BAUD: u32 = 115_749;

/// Host UART baud after [`Chain::set_max_baud`].
pub const MAX_BAUD: u32 = 1_000_000;

/// Soft timeout on one result read.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Quiet period ending chip enumeration.
const ENUMERATION_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive result timeouts before the loud not-responding error.
pub const TIMEOUT_THRESHOLD: u32 = 2;

/// Frequency the chips wake up at; ramp start point.
const RAMP_START_MHZ: f32 = 56.25;

/// Ramp step size and settle time.
const RAMP_STEP_MHZ: f32 = 6.25;
const RAMP_SETTLE: Duration = Duration::from_millis(100);

/// Reset pulse width, each phase.
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Control of the chain's hardware reset line.
#[async_trait]
pub trait ResetPin: Send {
    async fn set_low(&mut self) -> io::Result<()>;
    async fn set_high(&mut self) -> io::Result<()>;
}

/// Reset line strapped high in hardware; the pulse degrades to plain
/// settling waits.
pub struct StrappedReset;

#[async_trait]
impl ResetPin for StrappedReset {
    async fn set_low(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn set_high(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The framed serial link plus host-side baud control.
pub trait ChainTransport:
    Stream<Item = io::Result<Response>> + Sink<Command, Error = io::Error> + Unpin + Send
{
    /// Reprogram the host UART after the chips switch baud.
    fn set_host_baud(&mut self, baud: u32) -> io::Result<()>;
}

impl ChainTransport for Framed<SerialStream, FrameCodec> {
    fn set_host_baud(&mut self, baud: u32) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.get_mut()
            .set_baud_rate(baud)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

#[cfg(test)]
impl ChainTransport for Framed<tokio::io::DuplexStream, FrameCodec> {
    fn set_host_baud(&mut self, _baud: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Bring-up parameters.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Target hash frequency in MHz.
    pub frequency_mhz: f32,
    /// Chips the board is built with; logged against the observed count.
    pub expected_chips: u16,
    /// Ticket-mask difficulty; defaults to the model's value.
    pub asic_difficulty: Option<u32>,
}

/// An initialized chip chain.
pub struct Chain<T, R> {
    transport: T,
    reset: R,
    model: AsicModel,
    frequency_mhz: f32,
    chip_count: usize,
    address_interval: u8,
    asic_difficulty: u32,
}

impl<T: ChainTransport, R: ResetPin> Chain<T, R> {
    /// Reset and configure the chain, ramp it to frequency, and switch the
    /// link to the high baud rate.
    pub async fn bring_up(
        transport: T,
        reset: R,
        model: AsicModel,
        config: ChainConfig,
    ) -> Result<Self, ChainError> {
        info!(%model, frequency = config.frequency_mhz, "Initializing chain");

        let mut chain = Self {
            transport,
            reset,
            model,
            frequency_mhz: RAMP_START_MHZ,
            chip_count: 0,
            address_interval: 0,
            asic_difficulty: config.asic_difficulty.unwrap_or(model.default_difficulty()),
        };

        chain.hardware_reset().await?;

        // Redundant writes guard against startup noise on the shared bus.
        for _ in 0..3 {
            chain.set_version_mask(STRATUM_DEFAULT_VERSION_MASK).await?;
        }

        chain.enumerate(config.expected_chips).await?;

        chain
            .write_register(
                true,
                0x00,
                RegisterAddress::InitControl,
                [0x00, 0x07, 0x00, 0x00],
            )
            .await?;
        chain
            .write_register(
                true,
                0x00,
                RegisterAddress::MiscControl,
                [0xFF, 0x0F, 0xC1, 0x00],
            )
            .await?;

        chain.transport.send(Command::ChainInactive).await?;
        for i in 0..chain.chip_count {
            chain
                .transport
                .send(Command::SetChipAddress {
                    chip_address: i as u8 * chain.address_interval,
                })
                .await?;
        }

        chain
            .write_register(
                true,
                0x00,
                RegisterAddress::CoreControl,
                [0x80, 0x00, 0x85, 0x40],
            )
            .await?;
        chain
            .write_register(
                true,
                0x00,
                RegisterAddress::CoreControl,
                [0x80, 0x00, 0x80, 0x20],
            )
            .await?;

        let difficulty = chain.asic_difficulty;
        chain.set_difficulty_mask(difficulty).await?;

        chain
            .write_register(
                true,
                0x00,
                RegisterAddress::AnalogMux,
                [0x00, 0x00, 0x00, 0x03],
            )
            .await?;
        chain
            .write_register(
                true,
                0x00,
                RegisterAddress::IoDriverStrength,
                [0x02, 0x11, 0x11, 0x11],
            )
            .await?;
        chain
            .write_register(
                false,
                0x00,
                RegisterAddress::UartRelay,
                [0x00, 0x7C, 0x00, 0x03],
            )
            .await?;

        // Per-chip clock-domain configuration.
        for i in 0..chain.chip_count {
            let address = i as u8 * chain.address_interval;
            chain
                .write_register(
                    false,
                    address,
                    RegisterAddress::InitControl,
                    [0x00, 0x07, 0x01, 0xF0],
                )
                .await?;
            chain
                .write_register(
                    false,
                    address,
                    RegisterAddress::MiscControl,
                    [0xF0, 0x00, 0xC1, 0x00],
                )
                .await?;
            for value in [
                [0x80, 0x00, 0x85, 0x40],
                [0x80, 0x00, 0x80, 0x20],
                [0x80, 0x00, 0x82, 0xAA],
            ] {
                chain
                    .write_register(false, address, RegisterAddress::CoreControl, value)
                    .await?;
            }
        }

        chain.ramp_to(config.frequency_mhz).await?;

        chain
            .write_register(
                true,
                0x00,
                RegisterAddress::NonceCount,
                [0x00, 0x00, 0x15, 0x1C],
            )
            .await?;

        chain.set_version_mask(STRATUM_DEFAULT_VERSION_MASK).await?;
        chain.set_max_baud().await?;

        Ok(chain)
    }

    /// Pulse the reset line: low then high, 100 ms each.
    async fn hardware_reset(&mut self) -> Result<(), ChainError> {
        self.reset.set_low().await?;
        sleep(RESET_PULSE).await;
        self.reset.set_high().await?;
        sleep(RESET_PULSE).await;
        Ok(())
    }

    /// Count chips by broadcasting a chip-id read and tallying replies
    /// until the bus stays quiet for a second.
    async fn enumerate(&mut self, expected: u16) -> Result<(), ChainError> {
        self.transport
            .send(Command::ReadRegister {
                broadcast: true,
                chip_address: 0x00,
                register: RegisterAddress::ChipId,
            })
            .await?;

        let mut count = 0usize;
        loop {
            match timeout(ENUMERATION_TIMEOUT, self.transport.next()).await {
                Err(_) => break,
                Ok(None) => return Err(ChainError::Closed),
                Ok(Some(Ok(Response::ReadRegister { .. }))) => count += 1,
                Ok(Some(Ok(other))) => {
                    trace!(?other, "Unexpected frame during enumeration");
                }
                Ok(Some(Err(err))) => {
                    warn!(error = %err, "Dropped frame during enumeration");
                }
            }
        }

        info!(found = count, expected, "Chips detected on the chain");
        if count == 0 {
            return Err(ChainError::NoChipsDetected);
        }

        self.chip_count = count;
        self.address_interval = (256 / count) as u8;
        Ok(())
    }

    async fn write_register(
        &mut self,
        broadcast: bool,
        chip_address: u8,
        register: RegisterAddress,
        value: [u8; 4],
    ) -> Result<(), ChainError> {
        self.transport
            .send(Command::WriteRegister {
                broadcast,
                chip_address,
                register,
                value,
            })
            .await?;
        Ok(())
    }

    /// Broadcast the version-rolling mask.
    pub async fn set_version_mask(&mut self, version_mask: u32) -> Result<(), ChainError> {
        self.write_register(
            true,
            0x00,
            RegisterAddress::VersionMask,
            version_mask_value(version_mask),
        )
        .await
    }

    /// Broadcast the ticket mask for `difficulty`, rounded down to a power
    /// of two. The applied value is retained for hashrate accounting.
    pub async fn set_difficulty_mask(&mut self, difficulty: u32) -> Result<(), ChainError> {
        self.asic_difficulty = largest_power_of_two(difficulty);
        info!(difficulty = self.asic_difficulty, "Setting chain ticket mask");
        self.write_register(
            true,
            0x00,
            RegisterAddress::TicketMask,
            difficulty_mask_value(difficulty),
        )
        .await
    }

    /// Program one PLL setpoint, falling back to 200 MHz when the target is
    /// not representable.
    async fn send_hash_frequency(&mut self, target_mhz: f32) -> Result<(), ChainError> {
        let (pll, actual) = match PllDividers::search(target_mhz) {
            Some(pll) => {
                let actual = pll.frequency();
                (pll, actual)
            }
            None => {
                warn!(target = target_mhz, "No PLL dividers found, using 200 MHz");
                (PllDividers::fallback_200mhz(), 200.0)
            }
        };

        debug!(
            target = format!("{target_mhz:.2}"),
            actual = format!("{actual:.2}"),
            "Setting frequency"
        );
        self.write_register(
            true,
            0x00,
            RegisterAddress::PllDivider,
            pll.register_value(),
        )
        .await
    }

    /// Walk the frequency to `target_mhz` in 6.25 MHz steps with settle
    /// delays, aligning to a step boundary first, and finishing with the
    /// exact target.
    pub async fn ramp_to(&mut self, target_mhz: f32) -> Result<(), ChainError> {
        let mut current = self.frequency_mhz;
        let direction = if target_mhz > current {
            RAMP_STEP_MHZ
        } else {
            -RAMP_STEP_MHZ
        };

        if current % RAMP_STEP_MHZ != 0.0 {
            current = if direction > 0.0 {
                (current / RAMP_STEP_MHZ).ceil() * RAMP_STEP_MHZ
            } else {
                (current / RAMP_STEP_MHZ).floor() * RAMP_STEP_MHZ
            };
            self.send_hash_frequency(current).await?;
            sleep(RAMP_SETTLE).await;
        }

        while (direction > 0.0 && current < target_mhz)
            || (direction < 0.0 && current > target_mhz)
        {
            let step = direction.abs().min((target_mhz - current).abs());
            current += if direction > 0.0 { step } else { -step };
            self.send_hash_frequency(current).await?;
            sleep(RAMP_SETTLE).await;
        }

        self.send_hash_frequency(target_mhz).await?;
        self.frequency_mhz = target_mhz;
        info!(frequency = target_mhz, "Frequency ramp complete");
        Ok(())
    }

    /// Switch the chips, then the host UART, to 1 Mbaud.
    pub async fn set_max_baud(&mut self) -> Result<u32, ChainError> {
        info!(baud = MAX_BAUD, "Setting max baud");
        self.write_register(
            true,
            0x00,
            RegisterAddress::FastUart,
            [0x11, 0x30, 0x02, 0x00],
        )
        .await?;
        self.transport.set_host_baud(MAX_BAUD)?;
        Ok(MAX_BAUD)
    }

    /// Return the chips, then the host UART, to the power-on baud rate.
    pub async fn set_default_baud(&mut self) -> Result<u32, ChainError> {
        self.write_register(
            true,
            0x00,
            RegisterAddress::MiscControl,
            [0x00, 0x00, 0b0111_1010, 0b0011_0001],
        )
        .await?;
        self.transport.set_host_baud(INITIAL_BAUD)?;
        Ok(INITIAL_BAUD)
    }

    /// Chips found during enumeration.
    pub fn chip_count(&self) -> usize {
        self.chip_count
    }

    /// Ticket-mask difficulty currently applied (a power of two).
    ///
    /// Every nonce the chain reports is worth at least this difficulty;
    /// downstream hashrate accounting is denominated in it.
    pub fn asic_difficulty(&self) -> u32 {
        self.asic_difficulty
    }

    pub fn model(&self) -> AsicModel {
        self.model
    }

    /// Split into independent send and receive halves for the pipeline.
    pub fn split(self) -> (ChainSender<T>, ChainReceiver<T>) {
        let (sink, stream) = self.transport.split();
        (
            ChainSender {
                sink,
                model: self.model,
            },
            ChainReceiver {
                stream,
                timeout_count: 0,
            },
        )
    }
}

/// Job-transmit half of the chain.
pub struct ChainSender<T: ChainTransport> {
    sink: SplitSink<T, Command>,
    model: AsicModel,
}

impl<T: ChainTransport> ChainSender<T> {
    /// Transmit one job under the given registry slot id.
    pub async fn send_job(&mut self, job: &AsicJob, local_job_id: u8) -> Result<(), ChainError> {
        let payload = match self.model.job_format() {
            JobFormat::FullHeader => JobPayload::FullHeader {
                merkle_root_be: job.merkle_root_be,
                prev_block_hash_be: job.prev_block_hash_be,
                version: job.version,
            },
            JobFormat::Midstates => JobPayload::Midstates {
                merkle_tail: job.merkle_root[28..32].try_into().unwrap(),
                midstates: job.midstates,
                count: job.num_midstates,
            },
        };

        let frame = JobFrame {
            job_id: local_job_id,
            num_midstates: job.num_midstates,
            starting_nonce: job.starting_nonce,
            nbits: job.nbits,
            ntime: job.ntime,
            payload,
        };

        trace!(job_id = format!("{local_job_id:02X}"), "Send job");
        self.sink.send(Command::Job(frame)).await?;
        Ok(())
    }
}

/// Result-receive half of the chain.
pub struct ChainReceiver<T: ChainTransport> {
    stream: SplitStream<T>,
    /// Consecutive soft timeouts; reset by any received frame.
    timeout_count: u32,
}

impl<T: ChainTransport> ChainReceiver<T> {
    /// Wait for the next nonce frame.
    ///
    /// `Ok(None)` covers the recoverable cases: a soft timeout, a dropped
    /// corrupt frame, or a non-result frame. After [`TIMEOUT_THRESHOLD`]
    /// consecutive timeouts an operator-visible error is logged; the
    /// hardware may be stuck, but recovery is left to the operator.
    pub async fn receive(&mut self) -> Result<Option<ResultFrame>, ChainError> {
        match timeout(RESPONSE_TIMEOUT, self.stream.next()).await {
            Err(_) => {
                self.timeout_count += 1;
                if self.timeout_count >= TIMEOUT_THRESHOLD {
                    error!(
                        timeouts = self.timeout_count,
                        "Chain not sending results"
                    );
                    self.timeout_count = 0;
                }
                Ok(None)
            }
            Ok(None) => Err(ChainError::Closed),
            Ok(Some(Err(err))) => {
                warn!(error = %err, "Serial read error, dropping frame");
                Ok(None)
            }
            Ok(Some(Ok(Response::Nonce(result)))) => {
                self.timeout_count = 0;
                Ok(Some(result))
            }
            Ok(Some(Ok(Response::ReadRegister {
                chip_address,
                register,
                ..
            }))) => {
                self.timeout_count = 0;
                trace!(chip_address, register, "Register reply outside bring-up");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::protocol::build_response_frame;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_transport() -> (Framed<DuplexStream, FrameCodec>, DuplexStream) {
        let (host_side, chip_side) = tokio::io::duplex(1 << 16);
        (Framed::new(host_side, FrameCodec), chip_side)
    }

    /// Minimal chip-side simulator: watches the raw TX byte stream and
    /// answers the enumeration probe with one chip-id reply and any job
    /// frame with the given nonce frame.
    async fn chip_simulator(mut chip_side: DuplexStream, nonce_frame: [u8; 11]) {
        const PROBE: [u8; 7] = [0x55, 0xAA, 0x52, 0x05, 0x00, 0x00, 0x0A];
        let id_reply = build_response_frame(&[0x13, 0x66, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], 0);

        let mut seen: Vec<u8> = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match chip_side.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            seen.extend_from_slice(&buf[..n]);

            if seen.windows(PROBE.len()).any(|w| w == PROBE) {
                chip_side.write_all(&id_reply).await.unwrap();
                seen.clear();
            }
            // A job header byte means the pipeline is live; report the
            // canned nonce once.
            if seen.windows(3).any(|w| w[0] == 0x55 && w[1] == 0xAA && w[2] == 0x21) {
                chip_side.write_all(&nonce_frame).await.unwrap();
                seen.clear();
            }
        }
    }

    fn capture_job() -> AsicJob {
        let params = serde_json::json!([
            "875b4b7",
            "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000",
            "aa",
            "bb",
            [],
            "20000000",
            "17023a04",
            "685468d7",
            false
        ]);
        let notification = Arc::new(
            crate::stratum_v1::MiningNotification::from_params(params.as_array().unwrap())
                .unwrap(),
        );
        crate::job::builder::JobBuilder::with_subrange(AsicModel::Bm1366, 0).build(
            &notification,
            &crate::stratum_v1::SessionParams::default(),
            0,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn bring_up_and_round_trip() {
        let (transport, chip_side) = test_transport();
        let nonce_frame =
            build_response_frame(&[0x4C, 0x03, 0x52, 0x75, 0x00, 0x38, 0x01, 0x00], 4);
        let simulator = tokio::spawn(chip_simulator(chip_side, nonce_frame));

        let chain = Chain::bring_up(
            transport,
            StrappedReset,
            AsicModel::Bm1366,
            ChainConfig {
                frequency_mhz: 200.0,
                expected_chips: 1,
                asic_difficulty: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(chain.chip_count(), 1);
        assert_eq!(chain.asic_difficulty(), 256);

        let (mut sender, mut receiver) = chain.split();
        sender.send_job(&capture_job(), 0x38).await.unwrap();

        let result = loop {
            if let Some(result) = receiver.receive().await.unwrap() {
                break result;
            }
        };
        assert_eq!(result.nonce, 0x7552034C);
        assert_eq!(result.job_id_hi(), 0x38);

        simulator.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_chain_counts_timeouts() {
        let (transport, _chip_side) = test_transport();

        // Skip bring-up; drive the receiver half directly.
        let chain = Chain {
            transport,
            reset: StrappedReset,
            model: AsicModel::Bm1366,
            frequency_mhz: RAMP_START_MHZ,
            chip_count: 1,
            address_interval: 0,
            asic_difficulty: 256,
        };
        let (_sender, mut receiver) = chain.split();

        assert!(receiver.receive().await.unwrap().is_none());
        assert_eq!(receiver.timeout_count, 1);
        // Second consecutive timeout trips the threshold and resets.
        assert!(receiver.receive().await.unwrap().is_none());
        assert_eq!(receiver.timeout_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_is_fatal() {
        let (transport, chip_side) = test_transport();
        drop(chip_side);

        let chain = Chain {
            transport,
            reset: StrappedReset,
            model: AsicModel::Bm1366,
            frequency_mhz: RAMP_START_MHZ,
            chip_count: 1,
            address_interval: 0,
            asic_difficulty: 256,
        };
        let (_sender, mut receiver) = chain.split();

        assert!(matches!(receiver.receive().await, Err(ChainError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn enumeration_failure_without_chips() {
        let (transport, chip_side) = test_transport();
        // Reader that discards everything and never replies.
        let sink_task = tokio::spawn(async move {
            let mut chip_side = chip_side;
            let mut buf = [0u8; 256];
            while matches!(chip_side.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let result = Chain::bring_up(
            transport,
            StrappedReset,
            AsicModel::Bm1366,
            ChainConfig {
                frequency_mhz: 200.0,
                expected_chips: 1,
                asic_difficulty: None,
            },
        )
        .await;

        assert!(matches!(result, Err(ChainError::NoChipsDetected)));
        sink_task.abort();
    }
}

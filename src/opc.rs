//! Particulate sensor bus protocol driver.
//!
//! The optical particle counter speaks a byte-oriented bus protocol: every
//! exchange transfers one command byte and reads one byte back. Before a
//! control command or a sample read the device must answer a readiness poll
//! with [`READY_BYTE`]; sample frames carry three little-endian `f32` channel
//! values followed by a CRC-16 trailer.
//!
//! The driver owns the bus channel exclusively and never lets a bus fault
//! escape as a crash: transport errors and checksum mismatches both surface
//! as invalid readings, and three consecutive invalid samples trigger one
//! automatic device restart cycle.

use crate::error::{NodeError, NodeResult};
use log::{debug, info, trace, warn};
use std::time::Duration;

/// Status byte the device answers once it is ready for the next command.
pub const READY_BYTE: u8 = 0xF3;
/// Poll byte that requests a particulate sample.
const CMD_SAMPLE: u8 = 0x32;
/// Poll byte used ahead of control opcodes.
const CMD_CONTROL: u8 = 0x03;

/// Control opcodes for the air-moving fan and the sensing laser.
const OPCODE_FAN_ON: u8 = 0x03;
const OPCODE_FAN_OFF: u8 = 0x02;
const OPCODE_LASER_ON: u8 = 0x07;
const OPCODE_LASER_OFF: u8 = 0x06;

/// Sample frame: 3 x 4-byte little-endian floats plus 2 checksum bytes.
pub const FRAME_LEN: usize = 14;
const FRAME_PAYLOAD_LEN: usize = 12;

/// Inner read retries per readiness exchange.
const READY_READ_RETRIES: u32 = 20;
/// Whole-exchange attempts before the call is a hard failure.
const EXCHANGE_ATTEMPTS: u32 = 3;
/// Invalid samples in a row before the device is restarted.
const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

/// Computes the reflected CRC-16 used by the sensor (poly 0xA001, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// One byte-for-byte exchange on the sensor bus.
///
/// Implementations own the underlying bus handle (SPI or a serial adapter);
/// the driver guarantees it never issues concurrent transfers.
pub trait BusChannel: Send {
    fn transfer(&mut self, byte: u8) -> NodeResult<u8>;
}

/// One raw tri-channel particulate reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    pub pm1: f64,
    pub pm2_5: f64,
    pub pm10: f64,
    pub valid: bool,
}

impl RawReading {
    /// Sentinel returned when the device gave no usable reply.
    pub const INVALID: RawReading = RawReading {
        pm1: -1.0,
        pm2_5: -1.0,
        pm10: -1.0,
        valid: false,
    };
}

/// Device lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Starting,
    Ready,
    Sampling,
    Restarting,
}

/// Delays of the readiness-polling ladder.
///
/// Defaults match the deployed device timings; tests shrink them to zero.
#[derive(Debug, Clone, Copy)]
pub struct OpcTiming {
    /// Delay between inner status reads.
    pub poll_retry: Duration,
    /// Back-off before retrying a whole readiness exchange.
    pub exchange_backoff: Duration,
    /// Gap between consecutive frame-byte transfers.
    pub byte_gap: Duration,
    /// Settle time after a control opcode.
    pub command_settle: Duration,
}

impl Default for OpcTiming {
    fn default() -> Self {
        Self {
            poll_retry: Duration::from_millis(20),
            exchange_backoff: Duration::from_secs(3),
            byte_gap: Duration::from_micros(20),
            command_settle: Duration::from_secs(1),
        }
    }
}

impl OpcTiming {
    /// Zero delays everywhere, for tests against scripted channels.
    pub fn instant() -> Self {
        Self {
            poll_retry: Duration::ZERO,
            exchange_backoff: Duration::ZERO,
            byte_gap: Duration::ZERO,
            command_settle: Duration::ZERO,
        }
    }
}

/// Driver for the particulate sensor.
///
/// All methods block on bus exchanges; callers run them on a blocking task.
pub struct OpcDriver<C: BusChannel> {
    channel: C,
    state: DriverState,
    consecutive_failures: u32,
    timing: OpcTiming,
}

impl<C: BusChannel> OpcDriver<C> {
    pub fn new(channel: C) -> Self {
        Self::with_timing(channel, OpcTiming::default())
    }

    pub fn with_timing(channel: C, timing: OpcTiming) -> Self {
        Self {
            channel,
            state: DriverState::Uninitialized,
            consecutive_failures: 0,
            timing,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Brings the device from `Uninitialized` to `Ready`: enables the fan,
    /// then the laser. A transport fault or an exhausted readiness ladder is
    /// a hard failure for this call and leaves the device uninitialized.
    pub fn start(&mut self) -> NodeResult<()> {
        self.state = DriverState::Starting;
        match self.bring_up() {
            Ok(()) => {
                info!("particulate sensor ready");
                self.state = DriverState::Ready;
                Ok(())
            }
            Err(err) => {
                self.state = DriverState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Issues the inverse control commands and releases the device.
    pub fn stop(&mut self) -> NodeResult<()> {
        let result = self
            .control(OPCODE_LASER_OFF, "laser off")
            .and_then(|()| self.control(OPCODE_FAN_OFF, "fan off"));
        self.state = DriverState::Uninitialized;
        result
    }

    /// Attempts one reading.
    ///
    /// Never fails: transport and integrity faults are absorbed into the
    /// invalid sentinel. Three invalid samples in a row trigger exactly one
    /// restart cycle and reset the failure counter.
    pub fn sample(&mut self) -> RawReading {
        if self.state != DriverState::Ready {
            debug!("sample requested while device not ready ({:?})", self.state);
            return RawReading::INVALID;
        }
        self.state = DriverState::Sampling;
        let reading = match self.read_frame() {
            Ok(reading) => reading,
            Err(err) => {
                debug!("sample attempt failed: {err}");
                RawReading::INVALID
            }
        };
        self.state = DriverState::Ready;

        if reading.valid {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
                warn!(
                    "{} consecutive invalid samples, restarting particulate sensor",
                    self.consecutive_failures
                );
                self.restart();
                self.consecutive_failures = 0;
            }
        }
        reading
    }

    fn bring_up(&mut self) -> NodeResult<()> {
        self.control(OPCODE_FAN_ON, "fan on")?;
        self.control(OPCODE_LASER_ON, "laser on")
    }

    fn restart(&mut self) {
        self.state = DriverState::Restarting;
        match self.bring_up() {
            Ok(()) => {
                info!("particulate sensor restarted");
                self.state = DriverState::Ready;
            }
            Err(err) => {
                warn!("particulate sensor restart failed: {err}");
                self.state = DriverState::Uninitialized;
            }
        }
    }

    fn control(&mut self, opcode: u8, action: &str) -> NodeResult<()> {
        self.poll_ready(CMD_CONTROL)?;
        std::thread::sleep(self.timing.byte_gap);
        let ack = self.channel.transfer(opcode)?;
        trace!("{action}: acknowledged with {ack:#04x}");
        std::thread::sleep(self.timing.command_settle);
        Ok(())
    }

    /// Readiness sub-protocol shared by control commands and sampling.
    ///
    /// Write the poll byte, read the status back; if it is not [`READY_BYTE`]
    /// retry the read up to [`READY_READ_RETRIES`] times with a short delay,
    /// then back off and retry the whole exchange, at most
    /// [`EXCHANGE_ATTEMPTS`] times.
    fn poll_ready(&mut self, poll: u8) -> NodeResult<()> {
        for attempt in 1..=EXCHANGE_ATTEMPTS {
            let mut status = self.channel.transfer(poll)?;
            let mut retried = false;
            let mut reads = 0;
            while status != READY_BYTE && reads < READY_READ_RETRIES {
                retried = true;
                std::thread::sleep(self.timing.poll_retry);
                status = self.channel.transfer(poll)?;
                reads += 1;
            }
            if status == READY_BYTE {
                if !retried {
                    // The device wants one settling poll when it answers on
                    // the very first read.
                    std::thread::sleep(self.timing.poll_retry);
                    let _ = self.channel.transfer(poll)?;
                }
                return Ok(());
            }
            debug!("device not ready (attempt {attempt}/{EXCHANGE_ATTEMPTS}), backing off");
            if attempt < EXCHANGE_ATTEMPTS {
                std::thread::sleep(self.timing.exchange_backoff);
            }
        }
        Err(NodeError::NotReady(EXCHANGE_ATTEMPTS))
    }

    fn read_frame(&mut self) -> NodeResult<RawReading> {
        self.poll_ready(CMD_SAMPLE)?;
        let mut frame = [0u8; FRAME_LEN];
        for byte in frame.iter_mut() {
            std::thread::sleep(self.timing.byte_gap);
            *byte = self.channel.transfer(CMD_SAMPLE)?;
        }
        let received = u16::from_le_bytes([frame[12], frame[13]]);
        let computed = crc16(&frame[..FRAME_PAYLOAD_LEN]);
        if received != computed {
            // A frame that fails the checksum is discarded wholesale, even
            // when its values look plausible.
            return Err(NodeError::Integrity { computed, received });
        }
        Ok(RawReading {
            pm1: f64::from(f32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]])),
            pm2_5: f64::from(f32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]])),
            pm10: f64::from(f32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]])),
            valid: true,
        })
    }
}

/// Serial-adapter bus channel for the particulate sensor.
#[cfg(feature = "bus_serial")]
pub mod serial {
    use super::BusChannel;
    use crate::error::{NodeError, NodeResult};
    use serialport::SerialPort;
    use std::io::{Read, Write};
    use std::time::Duration;

    pub struct SerialBusChannel {
        port: Box<dyn SerialPort>,
    }

    impl SerialBusChannel {
        pub fn open(path: &str, baud_rate: u32) -> NodeResult<Self> {
            let port = serialport::new(path, baud_rate)
                .timeout(Duration::from_millis(500))
                .open()
                .map_err(|err| {
                    NodeError::Transport(format!("failed to open bus channel '{path}': {err}"))
                })?;
            Ok(Self { port })
        }
    }

    impl BusChannel for SerialBusChannel {
        fn transfer(&mut self, byte: u8) -> NodeResult<u8> {
            self.port
                .write_all(&[byte])
                .map_err(|err| NodeError::Transport(err.to_string()))?;
            let mut reply = [0u8; 1];
            self.port
                .read_exact(&mut reply)
                .map_err(|err| NodeError::Transport(err.to_string()))?;
            Ok(reply[0])
        }
    }
}

/// Scripted bus channels for tests and bench-top runs without hardware.
pub mod mock {
    use super::{crc16, BusChannel, FRAME_LEN, READY_BYTE};
    use crate::error::{NodeError, NodeResult};
    use std::collections::VecDeque;

    enum Step {
        Byte(u8),
        Fault,
    }

    /// Replays a scripted sequence of bus replies and records every command
    /// byte the driver writes.
    #[derive(Default)]
    pub struct ScriptedChannel {
        replies: VecDeque<Step>,
        pub writes: Vec<u8>,
    }

    impl ScriptedChannel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_byte(&mut self, byte: u8) {
            self.replies.push_back(Step::Byte(byte));
        }

        pub fn push_fault(&mut self) {
            self.replies.push_back(Step::Fault);
        }

        /// Scripts one control exchange: ready status, settling poll, ack.
        pub fn push_control_ack(&mut self) {
            self.push_byte(READY_BYTE);
            self.push_byte(READY_BYTE);
            self.push_byte(0x00);
        }

        /// Scripts a full successful `start()` (fan on + laser on).
        pub fn push_startup(&mut self) {
            self.push_control_ack();
            self.push_control_ack();
        }

        /// Encodes a sample frame for the given channel values.
        pub fn encode_frame(pm1: f32, pm2_5: f32, pm10: f32) -> [u8; FRAME_LEN] {
            let mut frame = [0u8; FRAME_LEN];
            frame[0..4].copy_from_slice(&pm1.to_le_bytes());
            frame[4..8].copy_from_slice(&pm2_5.to_le_bytes());
            frame[8..12].copy_from_slice(&pm10.to_le_bytes());
            let crc = crc16(&frame[..12]);
            frame[12..14].copy_from_slice(&crc.to_le_bytes());
            frame
        }

        /// Scripts one sample exchange answering with a valid frame.
        pub fn push_sample(&mut self, pm1: f32, pm2_5: f32, pm10: f32) {
            self.push_byte(READY_BYTE);
            self.push_byte(READY_BYTE);
            for byte in Self::encode_frame(pm1, pm2_5, pm10) {
                self.push_byte(byte);
            }
        }

        /// Scripts one sample exchange whose frame fails the checksum.
        pub fn push_corrupt_sample(&mut self) {
            self.push_byte(READY_BYTE);
            self.push_byte(READY_BYTE);
            let mut frame = Self::encode_frame(1.0, 2.0, 3.0);
            frame[0] ^= 0x01;
            for byte in frame {
                self.push_byte(byte);
            }
        }
    }

    impl BusChannel for ScriptedChannel {
        fn transfer(&mut self, byte: u8) -> NodeResult<u8> {
            self.writes.push(byte);
            match self.replies.pop_front() {
                Some(Step::Byte(reply)) => Ok(reply),
                Some(Step::Fault) => Err(NodeError::Transport("scripted bus fault".into())),
                None => Err(NodeError::Transport("bus reply script exhausted".into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedChannel;
    use super::*;

    fn instant_driver(channel: ScriptedChannel) -> OpcDriver<ScriptedChannel> {
        OpcDriver::with_timing(channel, OpcTiming::instant())
    }

    fn started_driver(channel: &mut ScriptedChannel) {
        channel.push_startup();
    }

    #[test]
    fn crc_matches_known_vector() {
        // 0xA001/0xFFFF over "123456789" is the CRC-16/MODBUS check value.
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn crc_accepts_valid_frame_and_rejects_every_single_bit_flip() {
        let frame = ScriptedChannel::encode_frame(3.5, 7.25, 12.0);
        let trailer = u16::from_le_bytes([frame[12], frame[13]]);
        assert_eq!(crc16(&frame[..12]), trailer);

        for byte in 0..12 {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[byte] ^= 1 << bit;
                assert_ne!(
                    crc16(&corrupted[..12]),
                    trailer,
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn start_enables_fan_then_laser() {
        let mut channel = ScriptedChannel::new();
        channel.push_startup();
        let mut driver = instant_driver(channel);
        driver.start().expect("start");
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[test]
    fn start_fails_hard_when_device_never_ready() {
        let mut channel = ScriptedChannel::new();
        // 3 exchanges x (1 + 20 retries) status reads, never ready.
        for _ in 0..(3 * 21) {
            channel.push_byte(0x00);
        }
        let mut driver = instant_driver(channel);
        let err = driver.start().expect_err("must fail");
        assert!(matches!(err, NodeError::NotReady(3)));
        assert_eq!(driver.state(), DriverState::Uninitialized);
    }

    #[test]
    fn ready_after_inner_retries_succeeds() {
        let mut channel = ScriptedChannel::new();
        // First exchange: 5 not-ready reads, then ready. No settling poll
        // because the inner retry loop already ran.
        for _ in 0..5 {
            channel.push_byte(0x00);
        }
        channel.push_byte(READY_BYTE);
        channel.push_byte(0x00); // fan-on ack
        channel.push_control_ack(); // laser on
        let mut driver = instant_driver(channel);
        driver.start().expect("start");
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[test]
    fn sample_decodes_valid_frame() {
        let mut channel = ScriptedChannel::new();
        started_driver(&mut channel);
        channel.push_sample(1.5, 2.5, 10.0);
        let mut driver = instant_driver(channel);
        driver.start().expect("start");

        let reading = driver.sample();
        assert!(reading.valid);
        assert_eq!(reading.pm1, 1.5);
        assert_eq!(reading.pm2_5, 2.5);
        assert_eq!(reading.pm10, 10.0);
        assert_eq!(driver.consecutive_failures(), 0);
    }

    #[test]
    fn checksum_mismatch_discards_plausible_values() {
        let mut channel = ScriptedChannel::new();
        started_driver(&mut channel);
        channel.push_corrupt_sample();
        let mut driver = instant_driver(channel);
        driver.start().expect("start");

        let reading = driver.sample();
        assert_eq!(reading, RawReading::INVALID);
        assert_eq!(driver.consecutive_failures(), 1);
    }

    #[test]
    fn transport_fault_is_an_invalid_reading_not_a_crash() {
        let mut channel = ScriptedChannel::new();
        started_driver(&mut channel);
        channel.push_fault();
        let mut driver = instant_driver(channel);
        driver.start().expect("start");

        let reading = driver.sample();
        assert!(!reading.valid);
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[test]
    fn three_consecutive_failures_trigger_exactly_one_restart() {
        let mut channel = ScriptedChannel::new();
        started_driver(&mut channel);
        channel.push_corrupt_sample();
        channel.push_corrupt_sample();
        channel.push_corrupt_sample();
        channel.push_startup(); // restart cycle
        channel.push_sample(4.0, 5.0, 6.0);
        let mut driver = instant_driver(channel);
        driver.start().expect("start");

        driver.sample();
        driver.sample();
        let writes_before_restart = {
            let laser_on_count = |writes: &[u8]| {
                writes.iter().filter(|&&b| b == OPCODE_LASER_ON).count()
            };
            laser_on_count(&driver.channel.writes)
        };
        driver.sample();
        let laser_on_after: usize = driver
            .channel
            .writes
            .iter()
            .filter(|&&b| b == OPCODE_LASER_ON)
            .count();
        // Exactly one additional laser-on control command: one restart.
        assert_eq!(laser_on_after, writes_before_restart + 1);
        assert_eq!(driver.consecutive_failures(), 0);

        let reading = driver.sample();
        assert!(reading.valid);
    }

    #[test]
    fn valid_sample_resets_failure_counter_without_restart() {
        let mut channel = ScriptedChannel::new();
        started_driver(&mut channel);
        channel.push_corrupt_sample();
        channel.push_corrupt_sample();
        channel.push_sample(1.0, 1.0, 1.0);
        let mut driver = instant_driver(channel);
        driver.start().expect("start");

        driver.sample();
        driver.sample();
        assert_eq!(driver.consecutive_failures(), 2);
        let reading = driver.sample();
        assert!(reading.valid);
        assert_eq!(driver.consecutive_failures(), 0);
        // No restart happened: only the startup's laser-on write exists.
        let laser_on: usize = driver
            .channel
            .writes
            .iter()
            .filter(|&&b| b == OPCODE_LASER_ON)
            .count();
        assert_eq!(laser_on, 1);
    }

    #[test]
    fn sample_while_uninitialized_is_invalid() {
        let channel = ScriptedChannel::new();
        let mut driver = instant_driver(channel);
        assert_eq!(driver.sample(), RawReading::INVALID);
    }
}

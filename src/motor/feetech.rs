// Feetech STS3215 serial protocol implementation
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
//
// The bus owns the serial channel behind a single lock. Every public call is
// one transaction, so callers on different threads never interleave bytes.

use parking_lot::Mutex;
use serialport::{self, SerialPort};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Default serial configuration for Feetech motors
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Broadcast ID used by sync instructions
pub const BROADCAST_ID: u8 = 0xFE;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

impl Instruction {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Read),
            0x03 => Some(Self::Write),
            0x82 => Some(Self::SyncRead),
            0x83 => Some(Self::SyncWrite),
            _ => None,
        }
    }
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    // EEPROM area (persists across power cycles)
    ModelNumber = 3,       // 2 bytes, read-only
    ReturnDelayTime = 7,   // 1 byte
    MinPositionLimit = 9,  // 2 bytes
    MaxPositionLimit = 11, // 2 bytes
    PCoefficient = 21,     // 1 byte
    DCoefficient = 22,     // 1 byte
    ICoefficient = 23,     // 1 byte
    HomingOffset = 31,     // 2 bytes (sign-magnitude, bit 11)
    OperatingMode = 33,    // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step

    // RAM area (volatile)
    TorqueEnable = 40,        // 1 byte: 0=off, 1=on
    Acceleration = 41,        // 1 byte
    GoalPosition = 42,        // 2 bytes
    GoalVelocity = 46,        // 2 bytes (sign-magnitude, bit 15)
    Lock = 55,                // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56,     // 2 bytes, read-only
    PresentVelocity = 58,     // 2 bytes, read-only (sign-magnitude, bit 15)
    MaximumAcceleration = 85, // 1 byte
}

impl Register {
    pub fn address(self) -> u8 {
        self as u8
    }

    /// Width of the register in bytes
    pub fn size(self) -> u8 {
        match self {
            Register::ModelNumber
            | Register::MinPositionLimit
            | Register::MaxPositionLimit
            | Register::HomingOffset
            | Register::GoalPosition
            | Register::GoalVelocity
            | Register::PresentPosition
            | Register::PresentVelocity => 2,
            _ => 1,
        }
    }

    /// Sign bit position for registers stored in sign-magnitude form
    pub fn sign_bit(self) -> Option<u8> {
        match self {
            Register::HomingOffset => Some(11),
            Register::GoalVelocity | Register::PresentVelocity => Some(15),
            _ => None,
        }
    }

    /// Encode an application value into the register's little-endian bytes
    pub fn encode(self, value: i32) -> Vec<u8> {
        match (self.size(), self.sign_bit()) {
            (1, _) => vec![value.clamp(0, u8::MAX as i32) as u8],
            (_, Some(bit)) => encode_sign_magnitude(value, bit).to_le_bytes().to_vec(),
            _ => (value.clamp(0, u16::MAX as i32) as u16).to_le_bytes().to_vec(),
        }
    }

    /// Decode the register's little-endian bytes into an application value
    pub fn decode(self, bytes: &[u8]) -> i32 {
        match (bytes, self.sign_bit()) {
            ([lo], _) => *lo as i32,
            ([lo, hi, ..], Some(bit)) => decode_sign_magnitude(u16::from_le_bytes([*lo, *hi]), bit),
            ([lo, hi, ..], None) => u16::from_le_bytes([*lo, *hi]) as i32,
            ([], _) => 0,
        }
    }
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
    Pwm = 2,
    Step = 3,
}

/// Error types for Feetech communication
#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },

    #[error("Motor bus is closed")]
    NotConnected,
}

impl FeetechError {
    /// Transient faults that a repeated read may clear
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeetechError::Timeout { .. }
                | FeetechError::ChecksumMismatch { .. }
                | FeetechError::InvalidResponse { .. }
        )
    }

    /// Faults of the serial link itself (unplugged adapter, dead port)
    pub fn is_fatal(&self) -> bool {
        match self {
            FeetechError::Serial(_) => true,
            FeetechError::Io(e) => e.kind() != io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Byte channel the bus talks through. Implemented by the serial port and by
/// the in-process simulated servo chain.
pub trait Transport: Send {
    fn write_all(&mut self, packet: &[u8]) -> io::Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
    /// Discard any stale bytes left over from a previous transaction
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Serial port transport for real hardware
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baudrate).timeout(timeout).open()?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, packet: &[u8]) -> io::Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.port.read_exact(buf)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Present position and velocity of one motor, read in a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorReading {
    pub position: i32,
    pub velocity: i32,
}

/// Feetech motor bus - handles serial communication with motors
pub struct FeetechBus {
    link: Mutex<Option<Box<dyn Transport>>>,
    read_retries: usize,
    transactions: AtomicU64,
}

impl FeetechBus {
    /// Open a serial connection to the motor bus
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let transport = SerialTransport::open(
            port_name,
            baudrate,
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
        )?;
        Ok(Self::with_transport(Box::new(transport), 0))
    }

    /// Wrap an already opened transport
    pub fn with_transport(transport: Box<dyn Transport>, read_retries: usize) -> Self {
        Self {
            link: Mutex::new(Some(transport)),
            read_retries,
            transactions: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Release the serial channel. Safe to call more than once.
    pub fn close(&self) {
        if self.link.lock().take().is_some() {
            debug!("Motor bus closed");
        }
    }

    /// Number of transactions issued on this bus
    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    /// Run one transaction with exclusive access to the link
    fn transact<T>(&self, f: impl FnOnce(&mut dyn Transport) -> Result<T>) -> Result<T> {
        let mut guard = self.link.lock();
        let link = guard.as_mut().ok_or(FeetechError::NotConnected)?;
        self.transactions.fetch_add(1, Ordering::Relaxed);
        f(link.as_mut())
    }

    /// Calculate checksum for a packet (excluding header)
    pub(crate) fn checksum(data: &[u8]) -> u8 {
        let sum: u32 = data.iter().map(|&b| b as u32).sum();
        (!sum & 0xFF) as u8
    }

    /// Frame a packet: header, id, length, code, params, checksum.
    /// Status replies share the layout with the error byte in the code slot.
    pub(crate) fn frame(id: u8, code: u8, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + code + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(code);
        packet.extend_from_slice(params);

        // Checksum over id, length, code, params
        let checksum = Self::checksum(&packet[2..]);
        packet.push(checksum);

        packet
    }

    /// Build an instruction packet with header and checksum
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        Self::frame(id, instruction as u8, params)
    }

    /// Ping a motor to check if it's connected
    pub fn ping(&self, id: u8) -> Result<bool> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.transact(|link| {
            link.clear_input()?;
            link.write_all(&packet)?;
            match read_status(link, id) {
                Ok(_) => Ok(true),
                Err(FeetechError::Timeout { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Read one register from one motor
    pub fn read(&self, id: u8, register: Register) -> Result<i32> {
        let params = [register.address(), register.size()];
        let packet = Self::build_packet(id, Instruction::Read, &params);
        let bytes = self.transact(|link| {
            link.clear_input()?;
            link.write_all(&packet)?;
            read_status(link, id)
        })?;

        if bytes.len() < register.size() as usize {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", register.size(), bytes.len()),
            });
        }
        Ok(register.decode(&bytes))
    }

    /// Write one register on one motor and wait for its status reply
    pub fn write(&self, id: u8, register: Register, value: i32) -> Result<()> {
        let mut params = vec![register.address()];
        params.extend(register.encode(value));
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!("Write to motor {}: reg={:?}, value={}", id, register, value);

        self.transact(|link| {
            link.clear_input()?;
            link.write_all(&packet)?;
            read_status(link, id).map(|_| ())
        })
    }

    /// Sync read: read the same register from several motors in one transaction.
    /// Retried on transient faults since reads have no side effects.
    pub fn read_register(&self, ids: &[u8], register: Register) -> Result<BTreeMap<u8, i32>> {
        let blocks = self.sync_read(ids, register.address(), register.size())?;
        Ok(blocks
            .into_iter()
            .map(|(id, bytes)| (id, register.decode(&bytes)))
            .collect())
    }

    /// Read present position and velocity of several motors in one transaction
    pub fn read_state(&self, ids: &[u8]) -> Result<BTreeMap<u8, MotorReading>> {
        let start = Register::PresentPosition;
        let len = Register::PresentPosition.size() + Register::PresentVelocity.size();
        let blocks = self.sync_read(ids, start.address(), len)?;

        Ok(blocks
            .into_iter()
            .map(|(id, bytes)| {
                let reading = MotorReading {
                    position: Register::PresentPosition.decode(&bytes[0..2]),
                    velocity: Register::PresentVelocity.decode(&bytes[2..4]),
                };
                (id, reading)
            })
            .collect())
    }

    /// Sync write: write the same register on several motors in one transaction.
    ///
    /// Sync writes carry no status reply and are never retried: a fault may
    /// have left some motors updated. Callers reconcile with a read.
    pub fn write_register(&self, values: &BTreeMap<u8, i32>, register: Register) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        // Sync write format:
        // [start_addr, data_length, id1, data1..., id2, data2..., ...]
        let mut params = vec![register.address(), register.size()];
        for (&id, &value) in values {
            params.push(id);
            params.extend(register.encode(value));
        }

        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        debug!("Sync write to {} motors: reg={:?}", values.len(), register);

        self.transact(|link| {
            link.write_all(&packet)?;
            Ok(())
        })
    }

    fn sync_read(&self, ids: &[u8], start: u8, len: u8) -> Result<BTreeMap<u8, Vec<u8>>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut params = vec![start, len];
        params.extend_from_slice(ids);
        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncRead, &params);

        let mut attempt = 0;
        loop {
            let result = self.transact(|link| {
                link.clear_input()?;
                link.write_all(&packet)?;

                let mut values = BTreeMap::new();
                for &id in ids {
                    let bytes = read_status(link, id)?;
                    if bytes.len() != len as usize {
                        return Err(FeetechError::InvalidResponse {
                            id,
                            reason: format!("Expected {} bytes, got {}", len, bytes.len()),
                        });
                    }
                    values.insert(id, bytes);
                }
                Ok(values)
            });

            match result {
                Ok(values) => return Ok(values),
                Err(e) if e.is_retryable() && attempt < self.read_retries => {
                    attempt += 1;
                    warn!("Sync read failed ({}), retry {}/{}", e, attempt, self.read_retries);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn read_bytes(link: &mut dyn Transport, buf: &mut [u8], id: u8) -> Result<()> {
    link.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::UnexpectedEof {
            FeetechError::Timeout { id }
        } else {
            FeetechError::Io(e)
        }
    })
}

/// Read a status packet and return its parameters
fn read_status(link: &mut dyn Transport, expected_id: u8) -> Result<Vec<u8>> {
    let mut header = [0u8; 2];
    read_bytes(link, &mut header, expected_id)?;

    if header != HEADER {
        return Err(FeetechError::InvalidResponse {
            id: expected_id,
            reason: format!("Invalid header: {:02X?}", header),
        });
    }

    let mut id_length = [0u8; 2];
    read_bytes(link, &mut id_length, expected_id)?;
    let id = id_length[0];
    let length = id_length[1] as usize;

    if id != expected_id {
        return Err(FeetechError::InvalidResponse {
            id: expected_id,
            reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
        });
    }
    if length < 2 {
        return Err(FeetechError::InvalidResponse {
            id,
            reason: format!("Length {} too short", length),
        });
    }

    // Read remaining bytes (error + params + checksum = length bytes)
    let mut remaining = vec![0u8; length];
    read_bytes(link, &mut remaining, id)?;

    // Verify checksum
    let mut checksum_data = vec![id, length as u8];
    checksum_data.extend_from_slice(&remaining[..length - 1]);
    if FeetechBus::checksum(&checksum_data) != remaining[length - 1] {
        return Err(FeetechError::ChecksumMismatch { id });
    }

    // Check error status
    let error_status = remaining[0];
    if error_status != 0 {
        return Err(FeetechError::MotorError {
            id,
            status: error_status,
        });
    }

    // Return parameters (excluding error byte and checksum)
    Ok(remaining[1..length - 1].to_vec())
}

/// Encode a signed value to sign-magnitude format
/// Bit `sign_bit` = sign (1 = negative), lower bits = magnitude
pub fn encode_sign_magnitude(value: i32, sign_bit: u8) -> u16 {
    let sign_mask = 1u32 << sign_bit;
    let magnitude = value.unsigned_abs().min(sign_mask - 1);
    if value < 0 {
        (sign_mask | magnitude) as u16
    } else {
        magnitude as u16
    }
}

/// Decode sign-magnitude format to signed value
pub fn decode_sign_magnitude(raw: u16, sign_bit: u8) -> i32 {
    let sign_mask = 1u16 << sign_bit;
    let magnitude = (raw & (sign_mask - 1)) as i32;
    if raw & sign_mask != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::SimHandle;

    fn sim_bus(ids: &[u8], retries: usize) -> (SimHandle, FeetechBus) {
        let sim = SimHandle::new(ids);
        let bus = FeetechBus::with_transport(sim.transport(), retries);
        (sim, bus)
    }

    #[test]
    fn test_checksum() {
        // Example: ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        let data = [1u8, 4, 0x03, 30, 0, 2];
        let checksum = FeetechBus::checksum(&data);
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum, 215);
    }

    #[test]
    fn test_sign_magnitude_encoding() {
        assert_eq!(encode_sign_magnitude(0, 15), 0);
        assert_eq!(encode_sign_magnitude(100, 15), 100);
        assert_eq!(encode_sign_magnitude(-100, 15), 0x8064); // 0x8000 | 100
        assert_eq!(encode_sign_magnitude(-1, 15), 0x8001);

        assert_eq!(decode_sign_magnitude(0, 15), 0);
        assert_eq!(decode_sign_magnitude(100, 15), 100);
        assert_eq!(decode_sign_magnitude(0x8064, 15), -100);
        assert_eq!(decode_sign_magnitude(0x8001, 15), -1);
    }

    #[test]
    fn test_homing_offset_uses_bit_11() {
        assert_eq!(encode_sign_magnitude(-5, 11), 0x0805);
        assert_eq!(decode_sign_magnitude(0x0805, 11), -5);
        // Magnitude saturates below the sign bit
        assert_eq!(encode_sign_magnitude(5000, 11), 0x07FF);
        assert_eq!(Register::HomingOffset.encode(-5), vec![0x05, 0x08]);
        assert_eq!(Register::HomingOffset.decode(&[0x05, 0x08]), -5);
    }

    #[test]
    fn test_build_packet() {
        let packet = FeetechBus::build_packet(1, Instruction::Ping, &[]);
        // Header (2) + ID (1) + Length (1) + Instruction (1) + Checksum (1) = 6 bytes
        assert_eq!(packet.len(), 6);
        assert_eq!(packet[0], 0xFF);
        assert_eq!(packet[1], 0xFF);
        assert_eq!(packet[2], 1); // ID
        assert_eq!(packet[3], 2); // Length (instruction + checksum)
        assert_eq!(packet[4], 0x01); // PING instruction
    }

    #[test]
    fn test_ping_present_and_missing() {
        let (_sim, bus) = sim_bus(&[1, 2], 0);
        assert!(bus.ping(1).unwrap());
        assert!(!bus.ping(5).unwrap());
    }

    #[test]
    fn test_sync_read_is_one_transaction() {
        let (sim, bus) = sim_bus(&[1, 2, 3], 0);
        sim.set_position(1, 100);
        sim.set_position(2, 200);
        sim.set_position(3, 300);

        let positions = bus
            .read_register(&[1, 2, 3], Register::PresentPosition)
            .unwrap();
        assert_eq!(positions[&1], 100);
        assert_eq!(positions[&2], 200);
        assert_eq!(positions[&3], 300);
        assert_eq!(bus.transactions(), 1);
        assert_eq!(sim.packet_count(), 1);
    }

    #[test]
    fn test_read_state_decodes_signed_velocity() {
        let (sim, bus) = sim_bus(&[7, 8], 0);
        sim.set_position(7, 1234);
        sim.set_present_velocity(7, -250);
        sim.set_present_velocity(8, 40);

        let state = bus.read_state(&[7, 8]).unwrap();
        assert_eq!(
            state[&7],
            MotorReading {
                position: 1234,
                velocity: -250
            }
        );
        assert_eq!(state[&8].velocity, 40);
    }

    #[test]
    fn test_sync_read_retries_dropped_reply() {
        let (sim, bus) = sim_bus(&[1, 2], 2);
        sim.drop_next_replies(1);

        let positions = bus.read_register(&[1, 2], Register::PresentPosition);
        assert!(positions.is_ok());
        assert_eq!(bus.transactions(), 2);
    }

    #[test]
    fn test_sync_read_retries_corrupt_reply() {
        let (sim, bus) = sim_bus(&[1], 1);
        sim.corrupt_next_replies(1);
        assert!(bus.read_register(&[1], Register::PresentPosition).is_ok());
    }

    #[test]
    fn test_sync_read_gives_up_after_retries() {
        let (sim, bus) = sim_bus(&[1], 2);
        sim.drop_next_replies(3);

        let err = bus
            .read_register(&[1], Register::PresentPosition)
            .unwrap_err();
        assert!(matches!(err, FeetechError::Timeout { id: 1 }));
        assert_eq!(bus.transactions(), 3);
    }

    #[test]
    fn test_sync_write_is_not_retried() {
        let (sim, bus) = sim_bus(&[7, 8, 9], 2);
        sim.fail_next_writes(1);

        let values = BTreeMap::from([(7, 10), (8, -10), (9, 0)]);
        assert!(bus.write_register(&values, Register::GoalVelocity).is_err());
        assert_eq!(bus.transactions(), 1);
        assert_eq!(sim.sync_writes(Register::GoalVelocity).len(), 1);
        assert_eq!(sim.register(8, Register::GoalVelocity), 0);
    }

    #[test]
    fn test_sync_write_reaches_every_motor() {
        let (sim, bus) = sim_bus(&[7, 8, 9], 0);
        let values = BTreeMap::from([(7, 120), (8, -300), (9, 0)]);
        bus.write_register(&values, Register::GoalVelocity).unwrap();

        assert_eq!(sim.register(8, Register::GoalVelocity), -300);
        assert_eq!(sim.sync_writes(Register::GoalVelocity), vec![values]);
    }

    #[test]
    fn test_acked_write_and_read() {
        let (sim, bus) = sim_bus(&[4], 0);
        bus.write(4, Register::HomingOffset, -300).unwrap();
        assert_eq!(sim.register(4, Register::HomingOffset), -300);
        assert_eq!(bus.read(4, Register::HomingOffset).unwrap(), -300);
    }

    #[test]
    fn test_closed_bus_rejects_everything() {
        let (_sim, bus) = sim_bus(&[1], 0);
        bus.close();
        bus.close();

        assert!(!bus.is_open());
        assert!(matches!(bus.ping(1), Err(FeetechError::NotConnected)));
        assert!(matches!(
            bus.read_register(&[1], Register::PresentPosition),
            Err(FeetechError::NotConnected)
        ));
        assert!(matches!(
            bus.write_register(&BTreeMap::from([(1, 0)]), Register::TorqueEnable),
            Err(FeetechError::NotConnected)
        ));
    }
}

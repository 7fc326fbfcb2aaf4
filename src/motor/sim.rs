// Simulated Feetech servo chain
//
// Speaks the same wire protocol as real STS3215 servos so the whole stack
// (bus, normalization, controller) runs without hardware. Servos reach their
// goal instantly. The handle exposes traffic counters and fault injection.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use tracing::trace;

use super::feetech::{FeetechBus, Instruction, OperatingMode, Register, Transport};

const MEMORY_SIZE: usize = 128;
const MODEL_NUMBER_STS3215: i32 = 777;
const ENCODER_TICKS: i32 = 4096;

/// Resting raw position of a freshly powered simulated servo
pub const DEFAULT_POSITION: i32 = 2048;

struct SimServo {
    memory: [u8; MEMORY_SIZE],
    /// Encoder position before the homing offset is applied
    actual_position: i32,
}

impl SimServo {
    fn new() -> Self {
        let mut servo = Self {
            memory: [0; MEMORY_SIZE],
            actual_position: DEFAULT_POSITION,
        };
        servo.store(Register::ModelNumber, MODEL_NUMBER_STS3215);
        servo.store(Register::MinPositionLimit, 0);
        servo.store(Register::MaxPositionLimit, ENCODER_TICKS - 1);
        servo
    }

    fn store(&mut self, register: Register, value: i32) {
        let start = register.address() as usize;
        for (offset, byte) in register.encode(value).into_iter().enumerate() {
            self.memory[start + offset] = byte;
        }
    }

    fn load(&self, register: Register) -> i32 {
        let start = register.address() as usize;
        register.decode(&self.memory[start..start + register.size() as usize])
    }

    fn refresh(&mut self) {
        let offset = self.load(Register::HomingOffset);
        let present = (self.actual_position - offset).rem_euclid(ENCODER_TICKS);
        self.store(Register::PresentPosition, present);
    }

    fn read(&mut self, address: u8, len: u8) -> Option<Vec<u8>> {
        self.refresh();
        let start = address as usize;
        let end = start + len as usize;
        (end <= MEMORY_SIZE).then(|| self.memory[start..end].to_vec())
    }

    fn write(&mut self, address: u8, data: &[u8]) {
        let start = address as usize;
        if start + data.len() > MEMORY_SIZE {
            return;
        }
        self.memory[start..start + data.len()].copy_from_slice(data);

        let touches = |register: Register| {
            let reg = register.address() as usize;
            reg >= start && reg < start + data.len()
        };
        let position_mode = self.load(Register::OperatingMode) == OperatingMode::Position as i32;
        if touches(Register::GoalPosition) && position_mode {
            let goal = self.load(Register::GoalPosition);
            let offset = self.load(Register::HomingOffset);
            self.actual_position = (goal + offset).rem_euclid(ENCODER_TICKS);
        }
        if touches(Register::GoalVelocity) {
            let goal = self.load(Register::GoalVelocity);
            self.store(Register::PresentVelocity, goal);
        }
    }
}

#[derive(Default)]
struct SimState {
    servos: BTreeMap<u8, SimServo>,
    outbox: VecDeque<u8>,
    packets: Vec<Vec<u8>>,
    drop_replies: usize,
    corrupt_replies: usize,
    fail_writes: usize,
}

impl SimState {
    fn handle_packet(&mut self, packet: &[u8]) {
        let Some((id, instruction, params)) = parse_packet(packet) else {
            trace!("Simulated bus ignoring malformed packet {:02X?}", packet);
            return;
        };
        self.packets.push(packet.to_vec());

        let mut replies: Vec<Vec<u8>> = Vec::new();
        match instruction {
            Instruction::Ping => {
                if self.servos.contains_key(&id) {
                    replies.push(FeetechBus::frame(id, 0, &[]));
                }
            }
            Instruction::Read => {
                if let (Some(servo), [address, len]) = (self.servos.get_mut(&id), params) {
                    if let Some(data) = servo.read(*address, *len) {
                        replies.push(FeetechBus::frame(id, 0, &data));
                    }
                }
            }
            Instruction::Write => {
                if let (Some(servo), [address, data @ ..]) = (self.servos.get_mut(&id), params) {
                    servo.write(*address, data);
                    replies.push(FeetechBus::frame(id, 0, &[]));
                }
            }
            Instruction::SyncWrite => {
                if let [address, len, entries @ ..] = params {
                    let stride = *len as usize + 1;
                    for entry in entries.chunks_exact(stride) {
                        if let Some(servo) = self.servos.get_mut(&entry[0]) {
                            servo.write(*address, &entry[1..]);
                        }
                    }
                }
            }
            Instruction::SyncRead => {
                if let [address, len, ids @ ..] = params {
                    for target in ids {
                        if let Some(data) = self
                            .servos
                            .get_mut(target)
                            .and_then(|servo| servo.read(*address, *len))
                        {
                            replies.push(FeetechBus::frame(*target, 0, &data));
                        }
                    }
                }
            }
        }

        if replies.is_empty() {
            return;
        }
        if self.drop_replies > 0 {
            self.drop_replies -= 1;
            return;
        }
        let corrupt = self.corrupt_replies > 0;
        if corrupt {
            self.corrupt_replies -= 1;
        }
        for mut reply in replies {
            if corrupt {
                if let Some(checksum) = reply.last_mut() {
                    *checksum = checksum.wrapping_add(1);
                }
            }
            self.outbox.extend(reply);
        }
    }
}

/// Split a packet into (id, instruction, params), checking framing and checksum
fn parse_packet(packet: &[u8]) -> Option<(u8, Instruction, &[u8])> {
    let [0xFF, 0xFF, id, length, body @ ..] = packet else {
        return None;
    };
    let length = *length as usize;
    if length < 2 || body.len() != length {
        return None;
    }
    let (checksum, payload) = body.split_last()?;
    let mut checked = vec![*id, length as u8];
    checked.extend_from_slice(payload);
    if FeetechBus::checksum(&checked) != *checksum {
        return None;
    }
    let instruction = Instruction::from_byte(payload[0])?;
    Some((*id, instruction, &payload[1..]))
}

/// Shared handle onto a simulated servo chain
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Create a chain with one servo per id, all at rest mid-travel
    pub fn new(ids: &[u8]) -> Self {
        let servos = ids.iter().map(|&id| (id, SimServo::new())).collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                servos,
                ..SimState::default()
            })),
        }
    }

    /// A transport connected to this chain
    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(SimTransport {
            state: Arc::clone(&self.state),
        })
    }

    /// Number of packets put on the wire, including ones that failed
    pub fn packet_count(&self) -> usize {
        self.state.lock().packets.len()
    }

    /// Values carried by every sync write to `register`, in order
    pub fn sync_writes(&self, register: Register) -> Vec<BTreeMap<u8, i32>> {
        let state = self.state.lock();
        state
            .packets
            .iter()
            .filter_map(|packet| parse_packet(packet))
            .filter(|(_, instruction, params)| {
                *instruction == Instruction::SyncWrite && params.first() == Some(&register.address())
            })
            .map(|(_, _, params)| {
                let stride = register.size() as usize + 1;
                params
                    .get(2..)
                    .unwrap_or_default()
                    .chunks_exact(stride)
                    .map(|entry| (entry[0], register.decode(&entry[1..])))
                    .collect()
            })
            .collect()
    }

    /// Move a servo's encoder to `position` (before homing offset)
    pub fn set_position(&self, id: u8, position: i32) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.actual_position = position.rem_euclid(ENCODER_TICKS);
        }
    }

    pub fn set_present_velocity(&self, id: u8, velocity: i32) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.store(Register::PresentVelocity, velocity);
        }
    }

    /// Current value of a register as the servo would report it
    pub fn register(&self, id: u8, register: Register) -> i32 {
        let mut state = self.state.lock();
        match state.servos.get_mut(&id) {
            Some(servo) => {
                servo.refresh();
                servo.load(register)
            }
            None => 0,
        }
    }

    /// Swallow the replies to the next `count` packets
    pub fn drop_next_replies(&self, count: usize) {
        self.state.lock().drop_replies = count;
    }

    /// Damage the checksum of the replies to the next `count` packets
    pub fn corrupt_next_replies(&self, count: usize) {
        self.state.lock().corrupt_replies = count;
    }

    /// Time out the next `count` outgoing packets before they reach any servo
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().fail_writes = count;
    }
}

struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl Transport for SimTransport {
    fn write_all(&mut self, packet: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes > 0 {
            // Logged as sent, but never reaches the servos
            state.fail_writes -= 1;
            state.packets.push(packet.to_vec());
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated write timeout"));
        }
        state.handle_packet(packet);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.outbox.len() < buf.len() {
            state.outbox.clear();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply from simulated bus"));
        }
        for byte in buf.iter_mut() {
            *byte = state.outbox.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().outbox.clear();
        Ok(())
    }
}

//! Wire format of the control socket: one fixed-size record per
//! request, answered in-band by one record of the same shape.

use thiserror::Error;

/// First field of every record; anything else is rejected outright.
pub const MAGIC: u32 = 0x494e_4931; // "INI1"

/// Payload capacity. Carries a service identity or condition name on
/// the way in, a text payload (status JSON, error message) on the way
/// out.
pub const DATA_LEN: usize = 368;

/// Total record size on the wire: magic + op + level + data, 380
/// bytes.
pub const RECORD_LEN: usize = 12 + DATA_LEN;

/// Operations. The `level` field is overloaded per op: the runlevel for
/// `RunlevelSet`, the signal number for `Signal`, the cursor for
/// `SvcIter`; unused otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Op {
    Nop = 0,
    RunlevelGet = 1,
    RunlevelSet = 2,
    Reload = 3,
    Start = 4,
    Stop = 5,
    Restart = 6,
    Signal = 7,
    Status = 8,
    Query = 9,
    SvcIter = 10,
    CondGet = 11,
    CondSet = 12,
    CondClear = 13,
    Debug = 14,
    Reboot = 15,
    Halt = 16,
    Poweroff = 17,
    Suspend = 18,
    Ack = 200,
    Nack = 201,
}

impl Op {
    pub fn from_u32(v: u32) -> Option<Op> {
        let op = match v {
            0 => Op::Nop,
            1 => Op::RunlevelGet,
            2 => Op::RunlevelSet,
            3 => Op::Reload,
            4 => Op::Start,
            5 => Op::Stop,
            6 => Op::Restart,
            7 => Op::Signal,
            8 => Op::Status,
            9 => Op::Query,
            10 => Op::SvcIter,
            11 => Op::CondGet,
            12 => Op::CondSet,
            13 => Op::CondClear,
            14 => Op::Debug,
            15 => Op::Reboot,
            16 => Op::Halt,
            17 => Op::Poweroff,
            18 => Op::Suspend,
            200 => Op::Ack,
            201 => Op::Nack,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
    #[error("bad magic in control request")]
    BadMagic,
    #[error("unknown control operation {0}")]
    UnknownOp(u32),
}

/// One request or reply record.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    pub op: Op,
    pub level: u32,
    pub data: [u8; DATA_LEN],
}

impl Record {
    pub fn new(op: Op, level: u32) -> Record {
        Record {
            op,
            level,
            data: [0; DATA_LEN],
        }
    }

    /// Record with a text payload; overlong text is truncated.
    pub fn with_text(op: Op, level: u32, text: &str) -> Record {
        let mut rec = Record::new(op, level);
        let bytes = text.as_bytes();
        let n = bytes.len().min(DATA_LEN);
        rec.data[..n].copy_from_slice(&bytes[..n]);
        rec
    }

    pub fn ack() -> Record {
        Record::new(Op::Ack, 0)
    }

    pub fn ack_text(text: &str) -> Record {
        Record::with_text(Op::Ack, 0, text)
    }

    pub fn nack(text: &str) -> Record {
        Record::with_text(Op::Nack, 0, text)
    }

    /// Payload up to the first NUL, as text.
    pub fn text(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DATA_LEN);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.op as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&self.level.to_le_bytes());
        buf[12..].copy_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8; RECORD_LEN]) -> Result<Record, ProtoError> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(ProtoError::BadMagic);
        }
        let raw_op = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let op = Op::from_u32(raw_op).ok_or(ProtoError::UnknownOp(raw_op))?;
        let level = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&buf[12..]);
        Ok(Record { op, level, data })
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("op", &self.op)
            .field("level", &self.level)
            .field("data", &self.text())
            .finish()
    }
}

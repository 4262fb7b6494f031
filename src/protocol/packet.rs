use crate::error::{GearmanError, Result};

/// Size of the fixed binary header: magic + type code + body length.
pub const HEADER_LEN: usize = 12;

/// Direction marker carried in the first four bytes of every binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMagic {
    Req,
    Res,
}

impl PacketMagic {
    pub const REQ_BYTES: [u8; 4] = [0, b'R', b'E', b'Q'];
    pub const RES_BYTES: [u8; 4] = [0, b'R', b'E', b'S'];

    pub fn as_bytes(self) -> [u8; 4] {
        match self {
            PacketMagic::Req => Self::REQ_BYTES,
            PacketMagic::Res => Self::RES_BYTES,
        }
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self> {
        match bytes {
            Self::REQ_BYTES => Ok(PacketMagic::Req),
            Self::RES_BYTES => Ok(PacketMagic::Res),
            _ => Err(GearmanError::MalformedPacket(format!(
                "bad magic bytes {bytes:?}"
            ))),
        }
    }
}

/// Binary command codes, matching the Gearman wire protocol numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    WorkException = 25,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

impl PacketType {
    pub fn from_code(code: u32) -> Result<Self> {
        use PacketType::*;
        Ok(match code {
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            22 => SetClientId,
            25 => WorkException,
            28 => WorkData,
            29 => WorkWarning,
            30 => GrabJobUniq,
            31 => JobAssignUniq,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            other => return Err(GearmanError::UnknownPacketType(other)),
        })
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Exact number of NUL-separated arguments this packet type carries.
    /// The last argument is the raw tail of the body and may itself contain
    /// NUL bytes.
    pub fn arg_count(self) -> usize {
        use PacketType::*;
        match self {
            ResetAbilities | PreSleep | Noop | GrabJob | NoJob | GrabJobUniq => 0,
            CanDo | CantDo | JobCreated | WorkFail | GetStatus | EchoReq | EchoRes
            | SetClientId => 1,
            WorkComplete | WorkData | WorkWarning | WorkException | Error => 2,
            SubmitJob | SubmitJobBg | SubmitJobHigh | SubmitJobHighBg | SubmitJobLow
            | SubmitJobLowBg | JobAssign | WorkStatus => 3,
            JobAssignUniq => 4,
            StatusRes => 5,
        }
    }
}

/// One decoded protocol message. Immutable once constructed; everything
/// downstream of the codec works in terms of this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: PacketMagic,
    pub kind: PacketType,
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    pub fn new(magic: PacketMagic, kind: PacketType, args: Vec<Vec<u8>>) -> Result<Self> {
        if args.len() != kind.arg_count() {
            return Err(GearmanError::MalformedPacket(format!(
                "{kind:?} expects {} args, got {}",
                kind.arg_count(),
                args.len()
            )));
        }
        Ok(Self { magic, kind, args })
    }

    pub fn request(kind: PacketType, args: Vec<Vec<u8>>) -> Result<Self> {
        Self::new(PacketMagic::Req, kind, args)
    }

    pub fn response(kind: PacketType, args: Vec<Vec<u8>>) -> Result<Self> {
        Self::new(PacketMagic::Res, kind, args)
    }

    /// Argument bytes at `index`. Bounds are guaranteed by construction, so
    /// this only fails on an index the caller got wrong.
    pub fn arg(&self, index: usize) -> &[u8] {
        &self.args[index]
    }

    /// Argument at `index` decoded as UTF-8, for name-like fields.
    pub fn arg_str(&self, index: usize) -> Result<&str> {
        std::str::from_utf8(&self.args[index]).map_err(|_| {
            GearmanError::MalformedPacket(format!(
                "{:?} arg {index} is not valid UTF-8",
                self.kind
            ))
        })
    }

    /// Total encoded body length: args joined by single NUL separators.
    pub fn body_len(&self) -> usize {
        let args_len: usize = self.args.iter().map(|a| a.len()).sum();
        args_len + self.args.len().saturating_sub(1)
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Status codes carried by a `Response`.
pub mod status {
    pub const OK: u32 = 0;
    pub const SERVER_ERROR: u32 = 500;
}

/// Current wall clock as nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadKind {
    /// Fixed sleep of `value` seconds
    Rtt,
    /// Random sleep within `[0, value]` seconds
    Rttr,
    /// Spin every core for `value` seconds
    Cpu,
    /// Allocate and touch `value` MiB
    Mem,
    /// Run a command in the background
    Bcmd,
    /// Run a command and wait for it
    Fcmd,
}

impl FromStr for LoadKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rtt" => Ok(LoadKind::Rtt),
            "rttr" => Ok(LoadKind::Rttr),
            "cpu" => Ok(LoadKind::Cpu),
            "mem" => Ok(LoadKind::Mem),
            "bcmd" => Ok(LoadKind::Bcmd),
            "fcmd" => Ok(LoadKind::Fcmd),
            other => anyhow::bail!(
                "Invalid load type: {}, must be one of rtt, rttr, cpu, mem, bcmd, fcmd",
                other
            ),
        }
    }
}

impl fmt::Display for LoadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadKind::Rtt => "rtt",
            LoadKind::Rttr => "rttr",
            LoadKind::Cpu => "cpu",
            LoadKind::Mem => "mem",
            LoadKind::Bcmd => "bcmd",
            LoadKind::Fcmd => "fcmd",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadDirective {
    pub kind: LoadKind,
    pub value: String,
}

impl LoadDirective {
    pub fn new(kind: LoadKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Parses `KIND=VALUE`, the command line form of a load directive.
impl FromStr for LoadDirective {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Load directive must be KIND=VALUE, got {}", s))?;
        Ok(LoadDirective::new(kind.trim().parse()?, value.trim()))
    }
}

/// One unit of generated traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub name: String,
    pub stream_id: u32,
    pub sequence_id: u64,
    pub message_id: u64,
    /// Creation time, set once
    pub ctime: u64,
    /// Send time of the latest attempt
    #[serde(default)]
    pub stime: u64,
    /// Time the latest retry started, 0 if never retried
    #[serde(default)]
    pub rtime: u64,
    #[serde(default)]
    pub rcount: u64,
    #[serde(default, with = "base64_bytes")]
    pub meta: Vec<u8>,
    #[serde(default)]
    pub load: Vec<LoadDirective>,
    #[serde(default)]
    pub worker_id: u32,
}

impl Request {
    pub fn new(
        name: impl Into<String>,
        stream_id: u32,
        sequence_id: u64,
        message_id: u64,
        load: Vec<LoadDirective>,
    ) -> Self {
        Self {
            name: name.into(),
            stream_id,
            sequence_id,
            message_id,
            ctime: now_ns(),
            stime: 0,
            rtime: 0,
            rcount: 0,
            meta: Vec::new(),
            load,
            worker_id: 0,
        }
    }

    /// Marks the start of another attempt for this request.
    pub fn mark_retry(&mut self) {
        self.rcount += 1;
        self.rtime = now_ns();
    }

    pub fn is_retransmit(&self) -> bool {
        self.rcount > 0
    }
}

/// Result of one exchange attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u32,
    /// Server receive time
    #[serde(default)]
    pub ctime: u64,
    /// Server send time
    #[serde(default)]
    pub stime: u64,
    #[serde(default, with = "base64_bytes")]
    pub meta: Vec<u8>,
}

impl Response {
    pub fn ok(ctime: u64, stime: u64) -> Self {
        Self {
            status_code: status::OK,
            ctime,
            stime,
            meta: Vec::new(),
        }
    }

    /// Response standing in for an exchange that never produced one.
    pub fn failure(status_code: u32) -> Self {
        Self {
            status_code,
            ctime: 0,
            stime: 0,
            meta: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == status::OK
    }
}

/// Terminal record of one request: snapshot, last response, completion time.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub request: Request,
    pub response: Response,
    pub timestamp: u64,
}

impl Stat {
    pub fn new(request: Request, response: Response, timestamp: u64) -> Self {
        Self {
            request,
            response,
            timestamp,
        }
    }

    /// Queue wait: creation to latest send.
    pub fn cdelta(&self) -> i64 {
        diff(self.request.ctime, self.request.stime)
    }

    /// Retry start to latest send, 0 if never retried.
    pub fn rdelta(&self) -> i64 {
        if self.request.rtime == 0 {
            0
        } else {
            diff(self.request.rtime, self.request.stime)
        }
    }

    /// Send to server receive.
    pub fn sdelta(&self) -> i64 {
        diff(self.request.stime, self.response.ctime)
    }

    /// Server processing time.
    pub fn pdelta(&self) -> i64 {
        diff(self.response.ctime, self.response.stime)
    }

    /// Server send to completion.
    pub fn bdelta(&self) -> i64 {
        diff(self.response.stime, self.timestamp)
    }

    pub fn rtt(&self) -> i64 {
        diff(self.request.ctime, self.timestamp)
    }
}

fn diff(before: u64, after: u64) -> i64 {
    after as i64 - before as i64
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

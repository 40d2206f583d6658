use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::error::{ProtocolError, Result};

// ─── Raw frames ───────────────────────────────────────────────────────

/// A command as it travels coordinator → worker, before payload validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

/// A result as it travels worker → coordinator, before payload validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl CommandFrame {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl ResultFrame {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| ProtocolError::invalid_payload(kind, e))
}

fn to_data<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

// ─── Payload types ────────────────────────────────────────────────────

/// Opaque binary payload, base64 on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(serde::de::Error::custom)
    }
}

/// Probabilities handed to the engine's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    pub mutation_rate: f64,
    pub crossover_rate: f64,
}

impl RunParams {
    pub fn new(mutation_rate: f64, crossover_rate: f64) -> Self {
        Self { mutation_rate, crossover_rate }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let rates = [
            ("mutation_rate", self.mutation_rate),
            ("crossover_rate", self.crossover_rate),
        ];
        for (name, p) in rates {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("{name} must be within [0, 1], got {p}"));
            }
        }
        Ok(())
    }
}

/// Announces which device a worker is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub platform_index: u32,
    pub device_index: u32,
}

/// Fitness summary of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub best: f64,
    pub avg: f64,
    pub worst: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub index: u64,
    pub result: GenerationStats,
}

/// Best chromosome found so far. The chromosome encoding belongs to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub chromosome: Value,
    pub fitness: f64,
}

// ─── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Prepare,
    Pause,
    Stop,
    Restore,
    Save,
    Best,
    Statistics,
    Run,
    Exit,
}

impl CommandKind {
    pub const ALL: [CommandKind; 9] = [
        CommandKind::Prepare,
        CommandKind::Pause,
        CommandKind::Stop,
        CommandKind::Restore,
        CommandKind::Save,
        CommandKind::Best,
        CommandKind::Statistics,
        CommandKind::Run,
        CommandKind::Exit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Prepare => "prepare",
            CommandKind::Pause => "pause",
            CommandKind::Stop => "stop",
            CommandKind::Restore => "restore",
            CommandKind::Save => "save",
            CommandKind::Best => "best",
            CommandKind::Statistics => "statistics",
            CommandKind::Run => "run",
            CommandKind::Exit => "exit",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Commands that act on an engine and are rejected before `prepare`.
    pub fn requires_engine(&self) -> bool {
        !matches!(self, CommandKind::Prepare | CommandKind::Exit)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated coordinator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Engine options, opaque to the protocol but always a JSON object.
    Prepare(Value),
    Pause,
    Stop,
    Restore(Blob),
    /// Destination the engine persists its state to.
    Save(String),
    Best,
    Statistics,
    Run(RunParams),
    Exit,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Prepare(_) => CommandKind::Prepare,
            Command::Pause => CommandKind::Pause,
            Command::Stop => CommandKind::Stop,
            Command::Restore(_) => CommandKind::Restore,
            Command::Save(_) => CommandKind::Save,
            Command::Best => CommandKind::Best,
            Command::Statistics => CommandKind::Statistics,
            Command::Run(_) => CommandKind::Run,
            Command::Exit => CommandKind::Exit,
        }
    }

    pub fn to_frame(&self) -> Result<CommandFrame> {
        let data = match self {
            Command::Prepare(options) => options.clone(),
            Command::Restore(blob) => to_data(blob)?,
            Command::Save(destination) => Value::String(destination.clone()),
            Command::Run(params) => to_data(params)?,
            Command::Pause
            | Command::Stop
            | Command::Best
            | Command::Statistics
            | Command::Exit => Value::Null,
        };
        Ok(CommandFrame {
            command: self.kind().as_str().to_string(),
            data,
        })
    }

    pub fn from_frame(frame: CommandFrame) -> Result<Self> {
        let kind = CommandKind::parse(&frame.command)
            .ok_or_else(|| ProtocolError::UnknownCommand(frame.command.clone()))?;
        let name = kind.as_str();
        let command = match kind {
            CommandKind::Prepare => {
                if !frame.data.is_object() {
                    return Err(ProtocolError::invalid_payload(
                        name,
                        "engine options must be an object",
                    ));
                }
                Command::Prepare(frame.data)
            }
            CommandKind::Pause => Command::Pause,
            CommandKind::Stop => Command::Stop,
            CommandKind::Restore => Command::Restore(payload(name, frame.data)?),
            CommandKind::Save => Command::Save(payload(name, frame.data)?),
            CommandKind::Best => Command::Best,
            CommandKind::Statistics => Command::Statistics,
            CommandKind::Run => {
                let params: RunParams = payload(name, frame.data)?;
                params
                    .validate()
                    .map_err(|reason| ProtocolError::invalid_payload(name, reason))?;
                Command::Run(params)
            }
            CommandKind::Exit => Command::Exit,
        };
        Ok(command)
    }

    /// Encode into a frame body (without delimiters).
    pub fn encode(&self) -> Result<Bytes> {
        self.to_frame()?.to_bytes()
    }

    /// Decode a frame body (without delimiters).
    pub fn decode(body: &[u8]) -> Result<Self> {
        Self::from_frame(CommandFrame::from_slice(body)?)
    }
}

impl TryFrom<CommandFrame> for Command {
    type Error = ProtocolError;

    fn try_from(frame: CommandFrame) -> Result<Self> {
        Command::from_frame(frame)
    }
}

// ─── Results ──────────────────────────────────────────────────────────

/// A validated worker result.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResult {
    DeviceInfo(DeviceInfo),
    GenerationResult(GenerationResult),
    /// Acknowledges a `save`; carries no body.
    Save,
    Best(BestResult),
    Statistics(Value),
    End,
}

impl WorkerResult {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerResult::DeviceInfo(_) => "device_info",
            WorkerResult::GenerationResult(_) => "generation_result",
            WorkerResult::Save => "save",
            WorkerResult::Best(_) => "best",
            WorkerResult::Statistics(_) => "statistics",
            WorkerResult::End => "end",
        }
    }

    pub fn to_frame(&self) -> Result<ResultFrame> {
        let data = match self {
            WorkerResult::DeviceInfo(info) => to_data(info)?,
            WorkerResult::GenerationResult(generation) => to_data(generation)?,
            WorkerResult::Best(best) => to_data(best)?,
            WorkerResult::Statistics(stats) => stats.clone(),
            WorkerResult::Save | WorkerResult::End => Value::Null,
        };
        Ok(ResultFrame {
            kind: self.kind().to_string(),
            data,
        })
    }

    pub fn from_frame(frame: ResultFrame) -> Result<Self> {
        let kind = frame.kind.as_str();
        let result = match kind {
            "device_info" => WorkerResult::DeviceInfo(payload(kind, frame.data)?),
            "generation_result" => WorkerResult::GenerationResult(payload(kind, frame.data)?),
            "save" => WorkerResult::Save,
            "best" => WorkerResult::Best(payload(kind, frame.data)?),
            "statistics" => WorkerResult::Statistics(frame.data),
            "end" => WorkerResult::End,
            other => return Err(ProtocolError::UnknownResult(other.to_string())),
        };
        Ok(result)
    }

    pub fn encode(&self) -> Result<Bytes> {
        self.to_frame()?.to_bytes()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Self::from_frame(ResultFrame::from_slice(body)?)
    }
}

impl TryFrom<ResultFrame> for WorkerResult {
    type Error = ProtocolError;

    fn try_from(frame: ResultFrame) -> Result<Self> {
        WorkerResult::from_frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_command_is_rejected_by_name() {
        let err = Command::decode(br#"{"command":"reboot","data":null}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(ref name) if name == "reboot"));
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        assert_eq!(Command::decode(br#"{"command":"best"}"#).unwrap(), Command::Best);
        assert_eq!(Command::decode(br#"{"command":"exit"}"#).unwrap(), Command::Exit);
    }

    #[test]
    fn test_run_rates_are_validated() {
        let ok = br#"{"command":"run","data":{"mutation_rate":0.05,"crossover_rate":0.9}}"#;
        let ok = Command::decode(ok).unwrap();
        assert_eq!(ok, Command::Run(RunParams::new(0.05, 0.9)));

        let bad = br#"{"command":"run","data":{"mutation_rate":1.5,"crossover_rate":0.9}}"#;
        let err = Command::decode(bad).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "run"));

        let err = Command::decode(br#"{"command":"run","data":[0.05]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_prepare_requires_object() {
        let err =
            Command::decode(br#"{"command":"prepare","data":"__import__('os')"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "prepare"));
    }

    #[test]
    fn test_blob_survives_every_byte_value() {
        let state: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
        let cmd = Command::Restore(Blob(state.clone()));
        let body = cmd.encode().unwrap();
        assert!(body.iter().all(|b| *b >= 0x20), "body must stay textual");
        match Command::decode(&body).unwrap() {
            Command::Restore(blob) => assert_eq!(blob.as_bytes(), &state[..]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_base64_is_invalid_payload() {
        let err = Command::decode(br#"{"command":"restore","data":"***"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "restore"));
    }

    #[test]
    fn test_result_frames_always_carry_data() {
        let body = WorkerResult::End.encode().unwrap();
        let raw: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(raw, json!({"type": "end", "data": null}));

        let generation = WorkerResult::GenerationResult(GenerationResult {
            index: 3,
            result: GenerationStats { best: -0.5, avg: -2.25, worst: -9.0 },
        });
        let raw: Value = serde_json::from_slice(&generation.encode().unwrap()).unwrap();
        assert_eq!(raw["type"], "generation_result");
        assert_eq!(raw["data"]["index"], 3);
        assert_eq!(raw["data"]["result"]["avg"], -2.25);
    }

    #[test]
    fn test_best_keeps_opaque_chromosome() {
        let best = WorkerResult::Best(BestResult {
            chromosome: json!({"genes": [3, 1, 2], "kernel": "tsp"}),
            fitness: 42.0,
        });
        assert_eq!(WorkerResult::decode(&best.encode().unwrap()).unwrap(), best);
    }

    #[test]
    fn test_unknown_result_type() {
        let err = WorkerResult::decode(br#"{"type":"progress","data":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownResult(_)));
    }

    #[test]
    fn test_requires_engine() {
        let gated: Vec<_> = CommandKind::ALL
            .into_iter()
            .filter(|k| k.requires_engine())
            .map(|k| k.as_str())
            .collect();
        assert_eq!(gated, ["pause", "stop", "restore", "save", "best", "statistics", "run"]);
    }
}

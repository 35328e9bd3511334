// src/runtime/command.rs

//! Control messages exchanged between agents over presence whispers/shouts.
//!
//! Frame 1 is UTF-8 text: either `KEYWORD arg...` or `PREFIX#<json>`. Replies
//! carrying values (`OUTPUTS`, `CURRENT_INPUTS`, `CURRENT_PARAMETERS`) append
//! `name / type tag / value bytes` frame triples.

use bytes::Bytes;

use crate::error::CommandError;
use crate::model::IopKind;
use crate::network::{DataMessage, Frames};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Stop,
    ClearMapping,
    Freeze,
    Unfreeze,
    MuteAll,
    UnmuteAll,
    Mute(String),
    Unmute(String),
    /// `SET_INPUT|SET_OUTPUT|SET_PARAMETER <name> <value>`; the value is the rest of the line.
    Set {
        kind: IopKind,
        name: String,
        value: String,
    },
    Map {
        input: String,
        agent: String,
        output: String,
    },
    Unmap {
        input: String,
        agent: String,
        output: String,
    },
    RequestOutputs,
    Outputs(Vec<DataMessage>),
    GetCurrentInputs,
    CurrentInputs(Vec<DataMessage>),
    GetCurrentParameters,
    CurrentParameters(Vec<DataMessage>),
    SetLogPath(String),
    SetDefinitionPath(String),
    SetMappingPath(String),
    SaveDefinitionToPath,
    SaveMappingToPath,
    ExternalDefinition(String),
    ExternalMapping(String),
    LoadThisDefinition(String),
    LoadThisMapping(String),
    // State notices about the sending peer.
    Muted(bool),
    Frozen(bool),
    State(String),
    OutputMuted(String),
    OutputUnmuted(String),
    LogFilePath(String),
    DefinitionFilePath(String),
    MappingFilePath(String),
    /// Host-level bus message; frames after the keyword are opaque.
    BusMessage(Frames),
}

const BLOB_PREFIXES: [&str; 4] = [
    "EXTERNAL_DEFINITION",
    "EXTERNAL_MAPPING",
    "LOAD_THIS_DEFINITION",
    "LOAD_THIS_MAPPING",
];

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Stop => "STOP",
            Command::ClearMapping => "CLEAR_MAPPING",
            Command::Freeze => "FREEZE",
            Command::Unfreeze => "UNFREEZE",
            Command::MuteAll => "MUTE_ALL",
            Command::UnmuteAll => "UNMUTE_ALL",
            Command::Mute(_) => "MUTE",
            Command::Unmute(_) => "UNMUTE",
            Command::Set { kind, .. } => set_keyword(*kind),
            Command::Map { .. } => "MAP",
            Command::Unmap { .. } => "UNMAP",
            Command::RequestOutputs => "REQUEST_OUPUTS",
            Command::Outputs(_) => "OUTPUTS",
            Command::GetCurrentInputs => "GET_CURRENT_INPUTS",
            Command::CurrentInputs(_) => "CURRENT_INPUTS",
            Command::GetCurrentParameters => "GET_CURRENT_PARAMETERS",
            Command::CurrentParameters(_) => "CURRENT_PARAMETERS",
            Command::SetLogPath(_) => "SET_LOG_PATH",
            Command::SetDefinitionPath(_) => "SET_DEFINITION_PATH",
            Command::SetMappingPath(_) => "SET_MAPPING_PATH",
            Command::SaveDefinitionToPath => "SAVE_DEFINITION_TO_PATH",
            Command::SaveMappingToPath => "SAVE_MAPPING_TO_PATH",
            Command::ExternalDefinition(_) => "EXTERNAL_DEFINITION",
            Command::ExternalMapping(_) => "EXTERNAL_MAPPING",
            Command::LoadThisDefinition(_) => "LOAD_THIS_DEFINITION",
            Command::LoadThisMapping(_) => "LOAD_THIS_MAPPING",
            Command::Muted(_) => "MUTED",
            Command::Frozen(_) => "FROZEN",
            Command::State(_) => "STATE",
            Command::OutputMuted(_) => "OUTPUT_MUTED",
            Command::OutputUnmuted(_) => "OUTPUT_UNMUTED",
            Command::LogFilePath(_) => "LOG_FILE_PATH",
            Command::DefinitionFilePath(_) => "DEFINITION_FILE_PATH",
            Command::MappingFilePath(_) => "MAPPING_FILE_PATH",
            Command::BusMessage(_) => "BUS_MESSAGE",
        }
    }

    pub fn parse(frames: &[Bytes]) -> Result<Command, CommandError> {
        let first = frames.first().ok_or(CommandError::Empty)?;
        let text = std::str::from_utf8(first).map_err(|_| CommandError::NotUtf8)?;
        if text.trim().is_empty() {
            return Err(CommandError::Empty);
        }

        if let Some((prefix, json)) = text.split_once('#') {
            if BLOB_PREFIXES.contains(&prefix) {
                let json = json.to_string();
                return Ok(match prefix {
                    "EXTERNAL_DEFINITION" => Command::ExternalDefinition(json),
                    "EXTERNAL_MAPPING" => Command::ExternalMapping(json),
                    "LOAD_THIS_DEFINITION" => Command::LoadThisDefinition(json),
                    _ => Command::LoadThisMapping(json),
                });
            }
        }

        let (keyword, rest) = match text.split_once(' ') {
            Some((k, r)) => (k, r),
            None => (text, ""),
        };
        let rest_owned = |command: &'static str| -> Result<String, CommandError> {
            if rest.trim().is_empty() {
                Err(CommandError::MissingArgument {
                    command,
                    expected: "an argument",
                })
            } else {
                Ok(rest.to_string())
            }
        };

        let cmd = match keyword {
            "STOP" => Command::Stop,
            "CLEAR_MAPPING" => Command::ClearMapping,
            "FREEZE" => Command::Freeze,
            "UNFREEZE" => Command::Unfreeze,
            "MUTE_ALL" => Command::MuteAll,
            "UNMUTE_ALL" => Command::UnmuteAll,
            "MUTE" => Command::Mute(rest_owned("MUTE")?),
            "UNMUTE" => Command::Unmute(rest_owned("UNMUTE")?),
            "SET_INPUT" => parse_set(IopKind::Input, rest)?,
            "SET_OUTPUT" => parse_set(IopKind::Output, rest)?,
            "SET_PARAMETER" => parse_set(IopKind::Parameter, rest)?,
            "MAP" => {
                let (input, agent, output) = parse_triple("MAP", rest)?;
                Command::Map {
                    input,
                    agent,
                    output,
                }
            }
            "UNMAP" => {
                let (input, agent, output) = parse_triple("UNMAP", rest)?;
                Command::Unmap {
                    input,
                    agent,
                    output,
                }
            }
            "REQUEST_OUPUTS" => Command::RequestOutputs,
            "OUTPUTS" => Command::Outputs(parse_values("OUTPUTS", &frames[1..])?),
            "GET_CURRENT_INPUTS" => Command::GetCurrentInputs,
            "CURRENT_INPUTS" => Command::CurrentInputs(parse_values("CURRENT_INPUTS", &frames[1..])?),
            "GET_CURRENT_PARAMETERS" => Command::GetCurrentParameters,
            "CURRENT_PARAMETERS" => {
                Command::CurrentParameters(parse_values("CURRENT_PARAMETERS", &frames[1..])?)
            }
            "SET_LOG_PATH" => Command::SetLogPath(rest_owned("SET_LOG_PATH")?),
            "SET_DEFINITION_PATH" => Command::SetDefinitionPath(rest_owned("SET_DEFINITION_PATH")?),
            "SET_MAPPING_PATH" => Command::SetMappingPath(rest_owned("SET_MAPPING_PATH")?),
            "SAVE_DEFINITION_TO_PATH" => Command::SaveDefinitionToPath,
            "SAVE_MAPPING_TO_PATH" => Command::SaveMappingToPath,
            "MUTED" => Command::Muted(parse_flag("MUTED", rest)?),
            "FROZEN" => Command::Frozen(parse_flag("FROZEN", rest)?),
            "STATE" => Command::State(rest.to_string()),
            "OUTPUT_MUTED" => Command::OutputMuted(rest_owned("OUTPUT_MUTED")?),
            "OUTPUT_UNMUTED" => Command::OutputUnmuted(rest_owned("OUTPUT_UNMUTED")?),
            "LOG_FILE_PATH" => Command::LogFilePath(rest_owned("LOG_FILE_PATH")?),
            "DEFINITION_FILE_PATH" => Command::DefinitionFilePath(rest_owned("DEFINITION_FILE_PATH")?),
            "MAPPING_FILE_PATH" => Command::MappingFilePath(rest_owned("MAPPING_FILE_PATH")?),
            "BUS_MESSAGE" => Command::BusMessage(frames[1..].to_vec()),
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(cmd)
    }

    pub fn to_frames(&self) -> Frames {
        let keyword = self.keyword();
        let line = |arg: &str| vec![Bytes::from(format!("{} {}", keyword, arg))];
        match self {
            Command::Mute(a)
            | Command::Unmute(a)
            | Command::SetLogPath(a)
            | Command::SetDefinitionPath(a)
            | Command::SetMappingPath(a)
            | Command::State(a)
            | Command::OutputMuted(a)
            | Command::OutputUnmuted(a)
            | Command::LogFilePath(a)
            | Command::DefinitionFilePath(a)
            | Command::MappingFilePath(a) => line(a),
            Command::Set { name, value, .. } => line(&format!("{} {}", name, value)),
            Command::Map {
                input,
                agent,
                output,
            }
            | Command::Unmap {
                input,
                agent,
                output,
            } => line(&format!("{} {} {}", input, agent, output)),
            Command::Muted(b) | Command::Frozen(b) => line(if *b { "1" } else { "0" }),
            Command::ExternalDefinition(json)
            | Command::ExternalMapping(json)
            | Command::LoadThisDefinition(json)
            | Command::LoadThisMapping(json) => vec![Bytes::from(format!("{}#{}", keyword, json))],
            Command::Outputs(values)
            | Command::CurrentInputs(values)
            | Command::CurrentParameters(values) => {
                let mut frames = vec![Bytes::from_static(keyword.as_bytes())];
                for v in values {
                    frames.extend(v.to_frames());
                }
                frames
            }
            Command::BusMessage(payload) => {
                let mut frames = vec![Bytes::from_static(keyword.as_bytes())];
                frames.extend(payload.iter().cloned());
                frames
            }
            _ => vec![Bytes::from_static(keyword.as_bytes())],
        }
    }
}

fn set_keyword(kind: IopKind) -> &'static str {
    match kind {
        IopKind::Input => "SET_INPUT",
        IopKind::Output => "SET_OUTPUT",
        IopKind::Parameter => "SET_PARAMETER",
    }
}

fn parse_set(kind: IopKind, rest: &str) -> Result<Command, CommandError> {
    let missing = CommandError::MissingArgument {
        command: set_keyword(kind),
        expected: "<name> <value>",
    };
    let (name, value) = rest.split_once(' ').ok_or(missing.clone())?;
    if name.is_empty() {
        return Err(missing);
    }
    Ok(Command::Set {
        kind,
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_triple(command: &'static str, rest: &str) -> Result<(String, String, String), CommandError> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        [input, agent, output] => Ok((input.to_string(), agent.to_string(), output.to_string())),
        _ => Err(CommandError::MissingArgument {
            command,
            expected: "<input> <agent> <output>",
        }),
    }
}

fn parse_flag(command: &'static str, rest: &str) -> Result<bool, CommandError> {
    match rest.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(CommandError::MissingArgument {
            command,
            expected: "0 or 1",
        }),
    }
}

fn parse_values(command: &'static str, frames: &[Bytes]) -> Result<Vec<DataMessage>, CommandError> {
    if frames.len() % 3 != 0 {
        return Err(CommandError::MissingArgument {
            command,
            expected: "name/type/value frame triples",
        });
    }
    frames
        .chunks(3)
        .map(|triple| {
            DataMessage::from_frames(triple).map_err(|_| CommandError::MissingArgument {
                command,
                expected: "name/type/value frame triples",
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IopValue;
    use crate::network::text_frames;

    fn parse_line(line: &str) -> Result<Command, CommandError> {
        Command::parse(&text_frames([line]))
    }

    #[test]
    fn mute_and_mute_all_are_distinct() {
        assert_eq!(parse_line("MUTE_ALL").unwrap(), Command::MuteAll);
        assert_eq!(parse_line("MUTE temp").unwrap(), Command::Mute("temp".into()));
        assert!(matches!(
            parse_line("MUTE"),
            Err(CommandError::MissingArgument { command: "MUTE", .. })
        ));
    }

    #[test]
    fn set_value_keeps_spaces() {
        assert_eq!(
            parse_line("SET_PARAMETER greeting hello big world").unwrap(),
            Command::Set {
                kind: IopKind::Parameter,
                name: "greeting".into(),
                value: "hello big world".into(),
            }
        );
        assert!(parse_line("SET_INPUT lonely").is_err());
    }

    #[test]
    fn blobs_keep_their_json_verbatim() {
        let json = r#"{"definition": {"name": "A # B"}}"#;
        let cmd = parse_line(&format!("EXTERNAL_DEFINITION#{}", json)).unwrap();
        assert_eq!(cmd, Command::ExternalDefinition(json.into()));
        assert_eq!(Command::parse(&cmd.to_frames()).unwrap(), cmd);
    }

    #[test]
    fn map_needs_three_names() {
        assert_eq!(
            parse_line("MAP t A temp").unwrap(),
            Command::Map {
                input: "t".into(),
                agent: "A".into(),
                output: "temp".into()
            }
        );
        assert!(parse_line("UNMAP t A").is_err());
    }

    #[test]
    fn outputs_reply_carries_triples() {
        let cmd = Command::Outputs(vec![
            DataMessage::new("temp", IopValue::Double(21.5)),
            DataMessage::new("on", IopValue::Bool(true)),
        ]);
        let frames = cmd.to_frames();
        assert_eq!(frames.len(), 7);
        assert_eq!(&frames[0][..], b"OUTPUTS");
        assert_eq!(Command::parse(&frames).unwrap(), cmd);

        let truncated = &frames[..5];
        assert!(Command::parse(truncated).is_err());
    }

    #[test]
    fn unknown_and_malformed_input() {
        assert_eq!(
            parse_line("DANCE now"),
            Err(CommandError::Unknown("DANCE".into()))
        );
        assert_eq!(Command::parse(&[]), Err(CommandError::Empty));
        assert_eq!(
            Command::parse(&[Bytes::from_static(&[0xff, 0xfe])]),
            Err(CommandError::NotUtf8)
        );
        assert!(parse_line("FROZEN maybe").is_err());
    }

    #[test]
    fn state_notices() {
        assert_eq!(parse_line("MUTED 1").unwrap(), Command::Muted(true));
        assert_eq!(
            Command::Frozen(false).to_frames(),
            text_frames(["FROZEN 0"])
        );
        assert_eq!(
            parse_line("STATE warming up").unwrap(),
            Command::State("warming up".into())
        );
        assert_eq!(parse_line("REQUEST_OUPUTS").unwrap(), Command::RequestOutputs);
    }
}

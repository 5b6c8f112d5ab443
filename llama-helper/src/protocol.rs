// ============================================================================
// Protocol Messages (JSON over stdin/stdout, one message per line)
// ============================================================================

use std::fmt::Display;
use std::path::PathBuf;

use llama_engine::EngineState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    LoadModel {
        path: PathBuf,
    },
    Download {
        url: String,
        file_name: String,
        #[serde(default)]
        min_bytes: u64,
    },
    Send {
        prompt: String,
        #[serde(default)]
        format_chat: bool,
    },
    Cancel,
    Bench {
        #[serde(default = "default_pp")]
        pp: i32,
        #[serde(default = "default_tg")]
        tg: i32,
        #[serde(default = "default_one")]
        pl: i32,
        #[serde(default = "default_one")]
        nr: i32,
    },
    CleanUp,
    State,
    SystemInfo,
    Ping,
    Shutdown,
}

fn default_pp() -> i32 {
    512
}

fn default_tg() -> i32 {
    128
}

fn default_one() -> i32 {
    1
}

impl Request {
    /// Requests answered straight away, without waiting behind engine work.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Request::Cancel | Request::State | Request::Ping | Request::Shutdown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Token { text: String },
    Done { fragments: usize },
    Progress { percent: u8 },
    Downloaded { path: String },
    Report { text: String },
    State { state: String, error: Option<String> },
    Info { text: String },
    Pong,
    Goodbye,
    Error { message: String },
}

impl Response {
    pub fn state(state: &EngineState) -> Self {
        Response::State {
            state: state.name().to_string(),
            error: state.error().map(|e| e.to_string()),
        }
    }

    pub fn error(message: impl Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_engine::EngineError;
    use std::sync::Arc;

    #[test]
    fn test_parse_requests() {
        let req: Request =
            serde_json::from_str(r#"{"type":"send","prompt":"hello","format_chat":true}"#).unwrap();
        assert_eq!(
            req,
            Request::Send {
                prompt: "hello".to_string(),
                format_chat: true
            }
        );

        let req: Request = serde_json::from_str(r#"{"type":"send","prompt":"hi"}"#).unwrap();
        assert!(matches!(req, Request::Send { format_chat: false, .. }));

        let req: Request = serde_json::from_str(r#"{"type":"clean_up"}"#).unwrap();
        assert_eq!(req, Request::CleanUp);

        let req: Request =
            serde_json::from_str(r#"{"type":"load_model","path":"/models/gemma.gguf"}"#).unwrap();
        assert_eq!(
            req,
            Request::LoadModel {
                path: PathBuf::from("/models/gemma.gguf")
            }
        );
    }

    #[test]
    fn test_bench_defaults() {
        let req: Request = serde_json::from_str(r#"{"type":"bench"}"#).unwrap();
        assert_eq!(
            req,
            Request::Bench {
                pp: 512,
                tg: 128,
                pl: 1,
                nr: 1
            }
        );
    }

    #[test]
    fn test_unknown_request_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"generate","prompt":"x"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"prompt":"x"}"#).is_err());
    }

    #[test]
    fn test_serialize_responses() {
        let json = serde_json::to_string(&Response::Token {
            text: "Hel".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"token","text":"Hel"}"#);

        let json = serde_json::to_string(&Response::Ok).unwrap();
        assert_eq!(json, r#"{"type":"ok"}"#);

        let json = serde_json::to_string(&Response::Progress { percent: 42 }).unwrap();
        assert_eq!(json, r#"{"type":"progress","percent":42}"#);
    }

    #[test]
    fn test_state_response_carries_error() {
        let state = EngineState::Error(Arc::new(EngineError::IoFailure(
            "failed to prepare resources".to_string(),
        )));
        match Response::state(&state) {
            Response::State { state, error } => {
                assert_eq!(state, "Error");
                assert!(error.unwrap().contains("failed to prepare resources"));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        assert_eq!(
            Response::state(&EngineState::ModelReady),
            Response::State {
                state: "ModelReady".to_string(),
                error: None
            }
        );
    }

    #[test]
    fn test_immediate_requests() {
        assert!(Request::Cancel.is_immediate());
        assert!(Request::Ping.is_immediate());
        assert!(!Request::CleanUp.is_immediate());
        assert!(!Request::SystemInfo.is_immediate());
    }
}

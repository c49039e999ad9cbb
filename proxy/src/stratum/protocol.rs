/// Stratum protocol message types and serialization
///
/// One JSON object per line. Requests are parsed into a closed set of
/// variants; responses know how to render themselves.

use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ProxyError, Result};
use crate::pow::{Uint128, Uint256};

/// Equihash(200, 9) solution length.
pub const SOLUTION_SIZE: usize = 1344;

/// Compact-size prefix carried in front of the solution on the wire.
pub const SOLUTION_PREFIX_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Subscribe,
    Authorize,
    Submit,
}

impl Method {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Subscribe => "mining.subscribe",
            Method::Authorize => "mining.authorize",
            Method::Submit => "mining.submit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mining.subscribe" => Some(Method::Subscribe),
            "mining.authorize" => Some(Method::Authorize),
            "mining.submit" => Some(Method::Submit),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-pushed method names
pub const NOTIFY: &str = "mining.notify";
pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const GET_VERSION: &str = "client.get_version";
pub const RECONNECT: &str = "client.reconnect";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Subscribe {
        id: Value,
        params: Vec<String>,
    },
    Authorize {
        id: Value,
        username: String,
        password: String,
    },
    Submit {
        id: Value,
        worker: String,
        job: String,
        ntime: u32,
        nonce_part2: Uint128,
        solution: Vec<u8>,
    },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Subscribe { .. } => Method::Subscribe,
            Request::Authorize { .. } => Method::Authorize,
            Request::Submit { .. } => Method::Submit,
        }
    }

    pub fn id(&self) -> &Value {
        match self {
            Request::Subscribe { id, .. }
            | Request::Authorize { id, .. }
            | Request::Submit { id, .. } => id,
        }
    }
}

/// Parse one line into a typed request.
pub fn parse(line: impl AsRef<[u8]>) -> Result<Request> {
    let env: Envelope = serde_json::from_slice(line.as_ref())?;

    let method = match Method::from_name(&env.method) {
        Some(m) => m,
        None => {
            return Err(ProxyError::UnknownMethod {
                id: env.id,
                method: env.method,
            })
        }
    };

    match method {
        Method::Subscribe => {
            // Params are informational (user agent, session resume); keep the strings.
            let params = match env.params {
                Some(Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect(),
                _ => Vec::new(),
            };
            Ok(Request::Subscribe { id: env.id, params })
        }

        Method::Authorize => {
            let [username, password] = string_params::<2>(&env.id, method, env.params)?;
            Ok(Request::Authorize {
                id: env.id,
                username,
                password,
            })
        }

        Method::Submit => {
            let [worker, job, ntime_hex, nonce_hex, solution_hex] =
                string_params::<5>(&env.id, method, env.params)?;

            let ntime = decode_hex(&env.id, "ntime", &ntime_hex, 4)?;
            let ntime = u32::from_be_bytes([ntime[0], ntime[1], ntime[2], ntime[3]]);

            let nonce_part2 = Uint128::from_hex(&nonce_hex).map_err(|e| ProxyError::BadInput {
                id: env.id.clone(),
                method: method.as_str(),
                reason: format!("nonce: {}", e),
            })?;

            let mut solution = decode_hex(
                &env.id,
                "solution",
                &solution_hex,
                SOLUTION_PREFIX_SIZE + SOLUTION_SIZE,
            )?;
            solution.drain(..SOLUTION_PREFIX_SIZE);

            Ok(Request::Submit {
                id: env.id,
                worker,
                job,
                ntime,
                nonce_part2,
                solution,
            })
        }
    }
}

fn string_params<const N: usize>(
    id: &Value,
    method: Method,
    params: Option<Value>,
) -> Result<[String; N]> {
    let bad = |reason: String| ProxyError::BadInput {
        id: id.clone(),
        method: method.as_str(),
        reason,
    };

    let items = match params {
        Some(Value::Array(items)) => items,
        _ => return Err(bad("params must be an array".to_string())),
    };
    if items.len() != N {
        return Err(bad(format!("expected {} params, got {}", N, items.len())));
    }

    let strings = items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            other => Err(bad(format!("expected string param, got {}", other))),
        })
        .collect::<Result<Vec<String>>>()?;

    strings
        .try_into()
        .map_err(|_| bad("param count changed during decode".to_string()))
}

fn decode_hex(id: &Value, field: &str, s: &str, len: usize) -> Result<Vec<u8>> {
    let bad = |reason: String| ProxyError::BadInput {
        id: id.clone(),
        method: Method::Submit.as_str(),
        reason: format!("{}: {}", field, reason),
    };

    let bytes = hex::decode(s).map_err(|e| bad(e.to_string()))?;
    if bytes.len() != len {
        return Err(bad(format!("expected {} bytes, got {}", len, bytes.len())));
    }
    Ok(bytes)
}

/// Error object carried in a general reply, rendered as `[code, message, null]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub const OTHER: i32 = 20;
    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::OTHER, message)
    }

    pub fn job_not_found() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "Job not found")
    }

    pub fn duplicate_share() -> Self {
        Self::new(Self::DUPLICATE_SHARE, "Duplicate share")
    }

    pub fn low_difficulty() -> Self {
        Self::new(Self::LOW_DIFFICULTY, "Low difficulty share")
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "Unauthorized worker")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("Unknown method {}", method))
    }

    /// Wire error for a request that failed to decode, when it earns a reply.
    pub fn from_parse_error(err: &ProxyError) -> Option<Self> {
        match err {
            ProxyError::BadInput { method, reason, .. } => {
                Some(Self::invalid_params(format!("{}: {}", method, reason)))
            }
            ProxyError::UnknownMethod { method, .. } => Some(Self::unknown_method(method)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        json!([self.code, self.message, null])
    }
}

/// `mining.notify` payload; also the header fields a job is checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub job: String,
    pub version: u32,
    pub prev_hash: Uint256,
    pub merkle_root: Uint256,
    pub reserved: Uint256,
    pub ntime: u32,
    pub nbits: u32,
    pub clean_jobs: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    SubscribeReply {
        id: Value,
        session: String,
        nonce_part1: Uint128,
    },
    Notify(Notify),
    SetDifficulty {
        target: Uint256,
    },
    /// Ask the miner for its software version; the answer is a general reply.
    GetVersion {
        id: Value,
    },
    /// Send the miner elsewhere after `wait_secs`.
    Reconnect {
        host: String,
        port: u16,
        wait_secs: u64,
    },
    General {
        id: Value,
        result: Value,
        error: Option<StratumError>,
    },
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Response::General {
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: Value, error: StratumError) -> Self {
        Response::General {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Response::SubscribeReply {
                id,
                session,
                nonce_part1,
            } => json!({
                "id": id,
                "result": [session, nonce_part1.to_hex()],
                "error": null,
            }),

            Response::Notify(n) => json!({
                "id": null,
                "method": NOTIFY,
                "params": [
                    n.job,
                    hex_u32(n.version),
                    n.prev_hash.to_hex(),
                    n.merkle_root.to_hex(),
                    n.reserved.to_hex(),
                    hex_u32(n.ntime),
                    hex_u32(n.nbits),
                    n.clean_jobs,
                ],
            }),

            Response::SetDifficulty { target } => json!({
                "id": null,
                "method": SET_DIFFICULTY,
                "params": [target.to_hex()],
            }),

            Response::GetVersion { id } => json!({
                "id": id,
                "method": GET_VERSION,
                "params": [],
            }),

            Response::Reconnect {
                host,
                port,
                wait_secs,
            } => json!({
                "id": null,
                "method": RECONNECT,
                "params": [host, port, wait_secs],
            }),

            Response::General { id, result, error } => json!({
                "id": id,
                "result": result,
                "error": error.as_ref().map(StratumError::to_value),
            }),
        }
    }
}

/// Render a response as one line, without the trailing newline.
pub fn serialize(response: &Response) -> String {
    response.to_json().to_string()
}

/// Header-order integer rendering shared by notify and the hashing preimage.
fn hex_u32(v: u32) -> String {
    hex::encode(v.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution_hex(fill: &str) -> String {
        format!("fd4005{}", fill.repeat(SOLUTION_SIZE))
    }

    fn submit_line(ntime: &str, nonce: &str, solution: &str) -> String {
        json!({
            "id": 7,
            "method": "mining.submit",
            "params": ["t1worker.rig", "h10-1", ntime, nonce, solution],
        })
        .to_string()
    }

    #[test]
    fn test_parse_subscribe() {
        let req = parse(r#"{"id":1,"method":"mining.subscribe","params":["miner/1.0",null,"x"]}"#)
            .unwrap();
        assert_eq!(
            req,
            Request::Subscribe {
                id: json!(1),
                params: vec!["miner/1.0".to_string(), "x".to_string()],
            }
        );

        let req = parse(r#"{"id":2,"method":"mining.subscribe","params":null}"#).unwrap();
        assert_eq!(req.method(), Method::Subscribe);

        let req = parse(r#"{"id":3,"method":"mining.subscribe"}"#).unwrap();
        assert_eq!(req.id(), &json!(3));
    }

    #[test]
    fn test_parse_authorize() {
        let req = parse(r#"{"id":"a","method":"mining.authorize","params":["user.w1","x"]}"#)
            .unwrap();
        assert_eq!(
            req,
            Request::Authorize {
                id: json!("a"),
                username: "user.w1".to_string(),
                password: "x".to_string(),
            }
        );
    }

    #[test]
    fn test_authorize_arity_is_bad_input() {
        for params in [r#"["only"]"#, r#"["a","b","c"]"#, r#"["a",5]"#, r#"{}"#] {
            let line = format!(r#"{{"id":9,"method":"mining.authorize","params":{}}}"#, params);
            let err = parse(&line).unwrap_err();
            assert!(
                matches!(err, ProxyError::BadInput { method: "mining.authorize", .. }),
                "params {} gave {:?}",
                params,
                err
            );
            assert_eq!(err.reply_id(), Some(&json!(9)));
        }
    }

    #[test]
    fn test_parse_submit() {
        let line = submit_line("5f5e1000", &"01".repeat(16), &solution_hex("ab"));
        match parse(&line).unwrap() {
            Request::Submit {
                id,
                worker,
                job,
                ntime,
                nonce_part2,
                solution,
            } => {
                assert_eq!(id, json!(7));
                assert_eq!(worker, "t1worker.rig");
                assert_eq!(job, "h10-1");
                assert_eq!(ntime, 0x5f5e1000);
                assert_eq!(nonce_part2, Uint128([0x01; 16]));
                assert_eq!(solution.len(), SOLUTION_SIZE);
                assert!(solution.iter().all(|b| *b == 0xab));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_submit_length_mismatches() {
        let nonce = "01".repeat(16);
        let cases = [
            submit_line("5f5e10", &nonce, &solution_hex("ab")),
            submit_line("5f5e1000", &"01".repeat(15), &solution_hex("ab")),
            submit_line("5f5e1000", &nonce, &solution_hex("ab")[2..]),
            submit_line("5f5e1000", &nonce, &format!("{}ab", solution_hex("ab"))),
            submit_line("zz5e1000", &nonce, &solution_hex("ab")),
        ];
        for line in cases {
            let err = parse(&line).unwrap_err();
            assert!(matches!(err, ProxyError::BadInput { method: "mining.submit", .. }));
        }

        let short = json!({"id": 1, "method": "mining.submit", "params": ["w", "j"]});
        assert!(matches!(
            parse(short.to_string()).unwrap_err(),
            ProxyError::BadInput { .. }
        ));
    }

    #[test]
    fn test_unknown_method_and_malformed() {
        let err = parse(r#"{"id":4,"method":"mining.extranonce.subscribe","params":[]}"#)
            .unwrap_err();
        match &err {
            ProxyError::UnknownMethod { id, method } => {
                assert_eq!(id, &json!(4));
                assert_eq!(method, "mining.extranonce.subscribe");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            StratumError::from_parse_error(&err).map(|e| e.code),
            Some(StratumError::INVALID_METHOD)
        );

        assert!(matches!(parse("{not json"), Err(ProxyError::Parse(_))));
        assert!(matches!(parse(r#"{"id":1}"#), Err(ProxyError::Parse(_))));
    }

    #[test]
    fn test_serialize_subscribe_reply() {
        let line = serialize(&Response::SubscribeReply {
            id: json!(1),
            session: String::new(),
            nonce_part1: Uint128::nonce_partition([0xaa; 8], 1),
        });
        assert!(!line.contains('\n'));

        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            v,
            json!({
                "id": 1,
                "result": ["", "aaaaaaaaaaaaaaaa0100000000000000"],
                "error": null,
            })
        );
    }

    #[test]
    fn test_serialize_notify() {
        let notify = Notify {
            job: "h100-3".to_string(),
            version: 4,
            prev_hash: Uint256([0x11; 32]),
            merkle_root: Uint256([0x22; 32]),
            reserved: Uint256::ZERO,
            ntime: 0x5f5e1000,
            nbits: 0x1d00ffff,
            clean_jobs: true,
        };
        let v: Value = serde_json::from_str(&serialize(&Response::Notify(notify))).unwrap();

        assert_eq!(v["id"], Value::Null);
        assert_eq!(v["method"], "mining.notify");
        let params = v["params"].as_array().unwrap();
        assert_eq!(params.len(), 8);
        assert_eq!(params[0], "h100-3");
        assert_eq!(params[1], "00000004");
        assert_eq!(params[2], "11".repeat(32));
        assert_eq!(params[3], "22".repeat(32));
        assert_eq!(params[4], "00".repeat(32));
        assert_eq!(params[5], "5f5e1000");
        assert_eq!(params[6], "1d00ffff");
        assert_eq!(params[7], true);
    }

    #[test]
    fn test_serialize_set_difficulty_and_errors() {
        let v = Response::SetDifficulty {
            target: crate::pow::POW_LIMIT,
        }
        .to_json();
        assert_eq!(v["method"], "mining.set_difficulty");
        assert_eq!(
            v["params"][0],
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );

        let v = Response::error(json!(5), StratumError::job_not_found()).to_json();
        assert_eq!(v["id"], 5);
        assert_eq!(v["result"], Value::Null);
        assert_eq!(v["error"], json!([21, "Job not found", null]));

        let v = Response::ok(json!(6), json!(true)).to_json();
        assert_eq!(v["result"], true);
        assert_eq!(v["error"], Value::Null);
    }

    #[test]
    fn test_serialize_client_methods() {
        let v: Value =
            serde_json::from_str(&serialize(&Response::GetVersion { id: json!(11) })).unwrap();
        assert_eq!(v, json!({"id": 11, "method": "client.get_version", "params": []}));

        let v = Response::Reconnect {
            host: "backup-pool.lan".to_string(),
            port: 3334,
            wait_secs: 5,
        }
        .to_json();
        assert_eq!(v["id"], Value::Null);
        assert_eq!(v["method"], "client.reconnect");
        assert_eq!(v["params"], json!(["backup-pool.lan", 3334, 5]));
    }
}

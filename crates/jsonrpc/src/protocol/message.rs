//! JSON-RPC 2.0 message model and its wire encoding.
//!
//! Parameters, results and error data are carried as [`RawValue`] so the
//! engine never re-encodes application payloads. Request ids are stored as
//! their raw JSON token, which lets a server echo them byte-for-byte and a
//! client correlate on exact text.

use std::fmt;

use bytes::Bytes;
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::protocol::legacy;

/// Protocol version tag written on every outbound message.
pub const VERSION: &str = "2.0";

/// Raw text of the version tag as it appears on the wire.
const VERSION_TOKEN: &str = "\"2.0\"";

/// A request identifier: a JSON number or string, kept as its raw token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(String);

impl Id {
    /// Creates a numeric id.
    #[must_use]
    pub fn number(n: u64) -> Self {
        Self(n.to_string())
    }

    /// Creates a string id.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self(serde_json::Value::String(s.into()).to_string())
    }

    /// Parses an id from a raw JSON token. Only numbers and strings qualify.
    #[must_use]
    pub fn from_raw(raw: &RawValue) -> Option<Self> {
        let text = raw.get();
        match text.as_bytes().first() {
            Some(b'"' | b'-' | b'0'..=b'9') => Some(Self(text.to_owned())),
            _ => None,
        }
    }

    /// Returns the id as an unsigned integer, if it is one.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Returns the decoded string, if this is a string id.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        if self.0.starts_with('"') {
            serde_json::from_str(&self.0).ok()
        } else {
            None
        }
    }

    /// The raw JSON text of the id.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for Id {
    fn from(n: u64) -> Self {
        Self::number(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        RawValue::from_string(self.0.clone())
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Self::from_raw(&raw).ok_or_else(|| D::Error::custom("id must be a number or a string"))
    }
}

/// A JSON-RPC error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Code(pub i32);

impl Code {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: Self = Self(-32700);
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: Self = Self(-32600);
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    /// Invalid method parameters.
    pub const INVALID_PARAMS: Self = Self(-32602);
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: Self = Self(-32603);

    /// Whether the code lies in the range reserved for server-defined errors.
    #[must_use]
    pub const fn is_server_reserved(self) -> bool {
        self.0 >= -32099 && self.0 <= -32000
    }

    /// Default message for the standard codes.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self.0 {
            -32700 => "Parse error",
            -32600 => "Invalid request",
            -32601 => "Method not found",
            -32602 => "Invalid params",
            -32603 => "Internal error",
            -32099..=-32000 => "Server error",
            _ => "Error",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Code {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

/// A structured JSON-RPC error.
///
/// Handlers may return this through `anyhow` to have it forwarded to the
/// caller verbatim instead of being wrapped as an internal error.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ErrorObject {
    /// Error code.
    pub code: Code,
    /// Short description.
    pub message: String,
    /// Optional extra information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl ErrorObject {
    /// Creates an error with the given code and message.
    pub fn new(code: impl Into<Code>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Creates an error carrying the standard message for `code`.
    #[must_use]
    pub fn from_code(code: Code) -> Self {
        Self::new(code, code.message())
    }

    /// Attaches a data payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be serialized.
    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> Result<Self> {
        self.data = Some(serde_json::value::to_raw_value(data)?);
        Ok(self)
    }

    /// A `ParseError` with detail text.
    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(Code::PARSE_ERROR, format!("Parse error: {detail}"))
    }

    /// An `InvalidRequest` with detail text.
    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(Code::INVALID_REQUEST, format!("Invalid request: {detail}"))
    }

    /// A `MethodNotFound` naming the method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Code::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// An `InvalidParams` with detail text.
    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(Code::INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    /// An `InternalError` carrying `message` as its text.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::INTERNAL_ERROR, message)
    }
}

/// A request or, when it has no id, a notification.
#[derive(Clone, Debug)]
pub struct Request {
    id: Option<Id>,
    method: String,
    params: Option<Box<RawValue>>,
}

impl Request {
    /// Creates a call carrying `id`.
    pub fn new(id: Id, method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Creates a notification.
    pub fn notification(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// The request id; `None` for notifications.
    #[must_use]
    pub const fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// The method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw parameters, if any.
    #[must_use]
    pub fn params(&self) -> Option<&RawValue> {
        self.params.as_deref()
    }

    /// Whether this request expects no reply.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Decodes the parameters into `T`. Absent parameters decode as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters do not match `T`.
    pub fn decode_params<T: DeserializeOwned>(&self) -> Result<T> {
        let text = self.params.as_deref().map_or("null", RawValue::get);
        Ok(serde_json::from_str(text)?)
    }

    pub(crate) fn into_parts(self) -> (Option<Id>, String, Option<Box<RawValue>>) {
        (self.id, self.method, self.params)
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            jsonrpc: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            id: Option<&'a Id>,
            method: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            params: Option<&'a RawValue>,
        }

        Wire {
            jsonrpc: VERSION,
            id: self.id.as_ref(),
            method: &self.method,
            params: self.params.as_deref(),
        }
        .serialize(serializer)
    }
}

/// A reply to a call: exactly one of a result or an error.
#[derive(Clone, Debug)]
pub struct Response {
    id: Id,
    outcome: std::result::Result<Box<RawValue>, ErrorObject>,
}

impl Response {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: Id, result: Box<RawValue>) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn failure(id: Id, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    /// The id of the call this response answers.
    #[must_use]
    pub const fn id(&self) -> &Id {
        &self.id
    }

    /// The raw result, if this is a success.
    #[must_use]
    pub fn result(&self) -> Option<&RawValue> {
        self.outcome.as_deref().ok()
    }

    /// The error, if this is a failure.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorObject> {
        self.outcome.as_ref().err()
    }

    /// Whether this response carries an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    /// Decodes the result into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rpc`] for an error response, or a JSON error if the
    /// result does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.outcome {
            Ok(result) => Ok(serde_json::from_str(result.get())?),
            Err(err) => Err(Error::Rpc(err.clone())),
        }
    }

    /// Consumes the response, returning its outcome.
    ///
    /// # Errors
    ///
    /// Returns the error object for an error response.
    pub fn into_result(self) -> std::result::Result<Box<RawValue>, ErrorObject> {
        self.outcome
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            jsonrpc: &'static str,
            id: &'a Id,
            #[serde(skip_serializing_if = "Option::is_none")]
            result: Option<&'a RawValue>,
            #[serde(skip_serializing_if = "Option::is_none")]
            error: Option<&'a ErrorObject>,
        }

        Wire {
            jsonrpc: VERSION,
            id: &self.id,
            result: self.result(),
            error: self.error(),
        }
        .serialize(serializer)
    }
}

/// An inbound item that could not be accepted, with the id recovered from
/// it (if any) so a reply can be addressed.
#[derive(Clone, Debug)]
pub struct Rejected {
    /// Id recovered from the item.
    pub id: Option<Id>,
    /// Why the item was rejected.
    pub error: ErrorObject,
}

impl Rejected {
    pub(crate) fn new(id: Option<Id>, error: ErrorObject) -> Self {
        Self { id, error }
    }
}

/// One decoded item of an inbound frame.
#[derive(Clone, Debug)]
pub enum Message {
    /// A call or notification.
    Request(Request),
    /// A reply to an earlier call.
    Response(Response),
    /// An item that is not a valid message.
    Invalid(Rejected),
}

/// A decoded inbound frame.
#[derive(Clone, Debug)]
pub struct Decoded {
    /// Whether the frame was a JSON array.
    pub batch: bool,
    /// The items, in frame order.
    pub items: Vec<Message>,
}

/// Every member an item may carry, each kept raw so validation can recover
/// the id even when other members are malformed.
#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    #[serde(default, deserialize_with = "present")]
    pub jsonrpc: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "present")]
    pub id: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "present")]
    pub method: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "present")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, deserialize_with = "present")]
    pub error: Option<Box<RawValue>>,
}

/// Distinguishes a member set to `null` from an absent member.
fn present<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Box<RawValue>>, D::Error> {
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

pub(crate) fn is_null(raw: &RawValue) -> bool {
    raw.get() == "null"
}

/// Drops members that are present but `null`.
pub(crate) fn non_null(raw: Option<Box<RawValue>>) -> Option<Box<RawValue>> {
    raw.filter(|raw| !is_null(raw))
}

/// Recovers the id of an item. `Ok(None)` means absent or `null`.
fn recover_id(raw: Option<&RawValue>) -> std::result::Result<Option<Id>, ErrorObject> {
    match raw {
        None => Ok(None),
        Some(raw) if is_null(raw) => Ok(None),
        Some(raw) => Id::from_raw(raw)
            .map(Some)
            .ok_or_else(|| ErrorObject::invalid_request("id must be a number or a string")),
    }
}

impl WireMessage {
    fn classify(self, allow_v1: bool) -> Message {
        let id = match recover_id(self.id.as_deref()) {
            Ok(id) => id,
            Err(error) => return Message::Invalid(Rejected::new(None, error)),
        };

        let legacy = match self.jsonrpc.as_deref() {
            Some(version) if version.get() == VERSION_TOKEN => false,
            Some(version) => {
                return Message::Invalid(Rejected::new(
                    id,
                    ErrorObject::invalid_request(format!(
                        "unsupported version {}",
                        version.get()
                    )),
                ));
            }
            None if allow_v1 => true,
            None => {
                return Message::Invalid(Rejected::new(
                    id,
                    ErrorObject::invalid_request("missing version tag"),
                ));
            }
        };

        if self.method.is_some() {
            self.into_request(id, legacy)
        } else {
            self.into_response(id, legacy)
        }
    }

    fn into_request(self, id: Option<Id>, legacy: bool) -> Message {
        let method = self
            .method
            .as_deref()
            .map(|raw| serde_json::from_str::<String>(raw.get()));
        let method = match method {
            Some(Ok(method)) => method,
            _ => {
                return Message::Invalid(Rejected::new(
                    id,
                    ErrorObject::invalid_request("method must be a string"),
                ));
            }
        };

        let params = non_null(self.params);
        if !legacy {
            if let Some(params) = &params {
                if !matches!(params.get().as_bytes().first(), Some(b'[' | b'{')) {
                    return Message::Invalid(Rejected::new(
                        id,
                        ErrorObject::invalid_request("params must be an array or an object"),
                    ));
                }
            }
        }

        Message::Request(Request { id, method, params })
    }

    fn into_response(self, id: Option<Id>, legacy: bool) -> Message {
        let Some(id) = id else {
            return Message::Invalid(Rejected::new(
                None,
                ErrorObject::invalid_request("response without id"),
            ));
        };

        let (result, error) = if legacy {
            legacy::split_outcome(self.result, self.error)
        } else {
            (self.result, self.error)
        };

        match (result, error) {
            (None, Some(error)) => match serde_json::from_str::<ErrorObject>(error.get()) {
                Ok(error) => Message::Response(Response::failure(id, error)),
                Err(e) => Message::Invalid(Rejected::new(
                    Some(id),
                    ErrorObject::invalid_request(format!("malformed error object: {e}")),
                )),
            },
            (Some(result), None) => Message::Response(Response::success(id, result)),
            (Some(_), Some(_)) => Message::Invalid(Rejected::new(
                Some(id),
                ErrorObject::invalid_request("response carries both result and error"),
            )),
            (None, None) => Message::Invalid(Rejected::new(
                Some(id),
                ErrorObject::invalid_request("response carries neither result nor error"),
            )),
        }
    }
}

/// Decodes one inbound frame into its items.
///
/// With `allow_v1` set, items without a version tag are translated from the
/// legacy envelope instead of being rejected.
///
/// # Errors
///
/// Returns a frame-level error, which never carries an id: `ParseError` for
/// invalid JSON, `InvalidRequest` for a non-structured top-level value. An
/// empty batch decodes to no items.
pub fn decode_frame(payload: &[u8], allow_v1: bool) -> std::result::Result<Decoded, ErrorObject> {
    let frame: Box<RawValue> = serde_json::from_slice(payload).map_err(ErrorObject::parse_error)?;
    let text = frame.get();
    let first = text.as_bytes().first().copied();

    let (batch, raw_items) = match first {
        Some(b'[') => {
            let items: Vec<Box<RawValue>> =
                serde_json::from_str(text).map_err(ErrorObject::parse_error)?;
            (true, items)
        }
        Some(b'{') => (false, vec![frame]),
        _ => return Err(ErrorObject::invalid_request("frame is not an object or array")),
    };

    let items = raw_items
        .into_iter()
        .map(|raw| match serde_json::from_str::<WireMessage>(raw.get()) {
            Ok(wire) => wire.classify(allow_v1),
            Err(e) => Message::Invalid(Rejected::new(None, ErrorObject::invalid_request(e))),
        })
        .collect();

    Ok(Decoded { batch, items })
}

/// Encodes items as one frame: a single object when `batch` is false and
/// there is exactly one item, otherwise a JSON array.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_frame<T: Serialize>(items: &[T], batch: bool) -> Result<Bytes> {
    let bytes = match items {
        [one] if !batch => serde_json::to_vec(one)?,
        _ => serde_json::to_vec(items)?,
    };
    Ok(Bytes::from(bytes))
}

/// Serializes `value` as raw JSON parameters. A value that serializes to
/// `null` (such as `()`) yields no parameters.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn to_params<T: Serialize + ?Sized>(value: &T) -> Result<Option<Box<RawValue>>> {
    let raw = serde_json::value::to_raw_value(value)?;
    Ok(if is_null(&raw) { None } else { Some(raw) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn raw(value: &serde_json::Value) -> Box<RawValue> {
        serde_json::value::to_raw_value(value).unwrap()
    }

    #[test]
    fn test_request_serialization() {
        let request = Request::new(Id::number(1), "subtract", Some(raw(&json!([42, 23]))));

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"jsonrpc":"2.0","id":1,"method":"subtract","params":[42,23]}"#
        );
    }

    #[test]
    fn test_notification_serialization() {
        let notification = Request::notification("update", Some(raw(&json!([1, 2, 3]))));
        assert!(notification.is_notification());

        let json = serde_json::to_string(&notification).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","method":"update","params":[1,2,3]}"#);
    }

    #[test]
    fn test_response_serialization() {
        let ok = Response::success(Id::string("a"), raw(&json!(19)));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"jsonrpc":"2.0","id":"a","result":19}"#
        );

        let err = Response::failure(Id::number(7), ErrorObject::from_code(Code::METHOD_NOT_FOUND));
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"Method not found"}}"#
        );
    }

    #[test]
    fn test_id_echoed_verbatim() {
        let decoded = decode_frame(br#"{"jsonrpc":"2.0","id":1.50,"method":"m"}"#, false).unwrap();
        let Message::Request(request) = &decoded.items[0] else {
            panic!("expected request");
        };
        let id = request.id().cloned().unwrap();
        assert_eq!(id.raw(), "1.50");

        let reply = Response::success(id, raw(&json!(true)));
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"jsonrpc":"2.0","id":1.50,"result":true}"#
        );
    }

    #[test]
    fn test_batch_roundtrip_preserves_order() {
        let requests = vec![
            Request::new(Id::number(1), "a", Some(raw(&json!({"x": 1})))),
            Request::notification("b", None),
            Request::new(Id::string("three"), "c", Some(raw(&json!([])))),
        ];

        let frame = encode_frame(&requests, true).unwrap();
        let decoded = decode_frame(&frame, false).unwrap();

        assert!(decoded.batch);
        assert_eq!(decoded.items.len(), 3);
        for (original, item) in requests.iter().zip(&decoded.items) {
            let Message::Request(item) = item else {
                panic!("expected request, got {item:?}");
            };
            assert_eq!(item.method(), original.method());
            assert_eq!(item.id(), original.id());
            assert_eq!(
                item.params().map(RawValue::get),
                original.params().map(RawValue::get)
            );
        }
    }

    #[test]
    fn test_empty_batch_decodes_to_no_items() {
        let frame = encode_frame::<Request>(&[], true).unwrap();
        assert_eq!(&frame[..], b"[]");
        let decoded = decode_frame(&frame, false).unwrap();
        assert!(decoded.batch);
        assert!(decoded.items.is_empty());
    }

    fn request_strategy() -> impl Strategy<Value = Request> {
        (
            proptest::option::of(0u64..1_000),
            "[A-Za-z][A-Za-z0-9.]{0,12}",
            proptest::option::of(proptest::collection::vec(-50i64..50, 0..4)),
        )
            .prop_map(|(id, method, params)| {
                let params = params.map(|values| raw(&json!(values)));
                match id {
                    Some(id) => Request::new(Id::number(id), method, params),
                    None => Request::notification(method, params),
                }
            })
    }

    proptest! {
        #[test]
        fn test_batch_of_any_size_roundtrips(
            requests in proptest::collection::vec(request_strategy(), 0..8),
        ) {
            let frame = encode_frame(&requests, true).unwrap();
            let decoded = decode_frame(&frame, false).unwrap();
            prop_assert!(decoded.batch);
            prop_assert_eq!(decoded.items.len(), requests.len());

            for (item, original) in decoded.items.iter().zip(&requests) {
                let Message::Request(item) = item else {
                    return Err(TestCaseError::fail(format!("expected request, got {item:?}")));
                };
                prop_assert_eq!(item.method(), original.method());
                prop_assert_eq!(item.id(), original.id());
                prop_assert_eq!(
                    item.params().map(RawValue::get),
                    original.params().map(RawValue::get)
                );
            }
        }
    }

    #[test]
    fn test_parse_error_has_no_id() {
        let err = decode_frame(b"{not json", false).unwrap_err();
        assert_eq!(err.code, Code::PARSE_ERROR);
    }

    #[test]
    fn test_invalid_request_recovers_id() {
        let decoded = decode_frame(br#"{"jsonrpc":"2.0","id":"q","method":5}"#, false).unwrap();
        let Message::Invalid(rejected) = &decoded.items[0] else {
            panic!("expected invalid item");
        };
        assert_eq!(rejected.id, Some(Id::string("q")));
        assert_eq!(rejected.error.code, Code::INVALID_REQUEST);
    }

    #[test]
    fn test_scalar_params_rejected() {
        let decoded = decode_frame(br#"{"jsonrpc":"2.0","id":2,"method":"m","params":3}"#, false)
            .unwrap();
        assert!(matches!(&decoded.items[0], Message::Invalid(r) if r.id == Some(Id::number(2))));
    }

    #[test]
    fn test_missing_version_rejected_without_v1() {
        let decoded = decode_frame(br#"{"id":4,"method":"m","params":[]}"#, false).unwrap();
        assert!(matches!(&decoded.items[0], Message::Invalid(r) if r.id == Some(Id::number(4))));
    }

    #[test]
    fn test_response_null_result_is_success() {
        let decoded = decode_frame(br#"{"jsonrpc":"2.0","id":3,"result":null}"#, false).unwrap();
        let Message::Response(response) = &decoded.items[0] else {
            panic!("expected response");
        };
        assert_eq!(response.result().map(RawValue::get), Some("null"));
    }

    #[test]
    fn test_response_decode_error() {
        let response = Response::failure(
            Id::number(1),
            ErrorObject::new(17, "boom").with_data(&json!({"why": "x"})).unwrap(),
        );
        let err = response.decode::<u32>().unwrap_err();
        let rpc = err.as_rpc().unwrap();
        assert_eq!(rpc.code, Code(17));
        assert_eq!(rpc.data.as_deref().map(RawValue::get), Some(r#"{"why":"x"}"#));
    }

    #[test]
    fn test_to_params_unit_is_absent() {
        assert!(to_params(&()).unwrap().is_none());
        assert_eq!(to_params(&["a"]).unwrap().unwrap().get(), r#"["a"]"#);
    }

    #[test]
    fn test_reserved_range() {
        assert!(Code(-32000).is_server_reserved());
        assert!(Code(-32099).is_server_reserved());
        assert!(!Code::INTERNAL_ERROR.is_server_reserved());
    }
}

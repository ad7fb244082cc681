//! Translation of the legacy (V1) envelope into the 2.0 model.
//!
//! A V1 message carries no `jsonrpc` member. Requests use a `null` id for
//! notifications and may pass any JSON value as `params`. Responses carry
//! both `result` and `error`, with the unused one set to `null`. Everything
//! is rewritten into 2.0 terms before dispatch, and replies are always
//! written as 2.0 responses.

use serde_json::value::RawValue;

use crate::protocol::message::non_null;

/// Splits a V1 response outcome. `error: null` means success, even when the
/// result itself is `null`; a non-null error wins over any result.
pub(crate) fn split_outcome(
    result: Option<Box<RawValue>>,
    error: Option<Box<RawValue>>,
) -> (Option<Box<RawValue>>, Option<Box<RawValue>>) {
    match non_null(error) {
        Some(error) => (None, Some(error)),
        None => (result, None),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::value::RawValue;

    use crate::protocol::message::{Code, Id, Message, decode_frame};

    #[test]
    fn test_v1_request_accepted() {
        let decoded = decode_frame(br#"{"method":"echo","params":"hi","id":9}"#, true).unwrap();
        let Message::Request(request) = &decoded.items[0] else {
            panic!("expected request");
        };
        assert_eq!(request.id(), Some(&Id::number(9)));
        assert_eq!(request.params().map(|p| p.get()), Some(r#""hi""#));
    }

    #[test]
    fn test_v1_null_id_is_notification() {
        let decoded = decode_frame(br#"{"method":"tick","params":[],"id":null}"#, true).unwrap();
        assert!(matches!(&decoded.items[0], Message::Request(r) if r.is_notification()));
    }

    #[test]
    fn test_v1_response_with_null_error() {
        let decoded = decode_frame(br#"{"result":5,"error":null,"id":1}"#, true).unwrap();
        let Message::Response(response) = &decoded.items[0] else {
            panic!("expected response");
        };
        assert_eq!(response.result().map(RawValue::get), Some("5"));
    }

    #[test]
    fn test_v1_response_with_error() {
        let decoded = decode_frame(
            br#"{"result":null,"error":{"code":-32601,"message":"nope"},"id":1}"#,
            true,
        )
        .unwrap();
        let Message::Response(response) = &decoded.items[0] else {
            panic!("expected response");
        };
        assert_eq!(response.error().map(|e| e.code), Some(Code::METHOD_NOT_FOUND));
    }

    #[test]
    fn test_wrong_version_rejected_even_with_v1() {
        let decoded = decode_frame(br#"{"jsonrpc":"1.0","method":"m","id":1}"#, true).unwrap();
        assert!(matches!(
            &decoded.items[0],
            Message::Invalid(r) if r.error.code == Code::INVALID_REQUEST
        ));
    }
}

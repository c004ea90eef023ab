//! On-wire transaction types.
//!
//! Every payload that crosses a secure channel after the catalogue
//! exchange is one `Transaction`: a tagged union with tag 0 = request and
//! tag 1 = response, encoded with bincode. Field ordering is stable;
//! optional fields are nullable.

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// An opaque scope identifier, local to the peer hosting the instance.
pub type ScopeId = u64;

/// The transaction union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transaction {
    /// Tag 0 — an invocation request.
    Request {
        id: u64,
        scope: Option<ScopeId>,
        /// `"service.method"`.
        procedure: String,
        /// bincode-encoded argument tuple.
        args: Vec<u8>,
    },
    /// Tag 1 — the response correlated by `id`.
    Response {
        id: u64,
        result: Option<Vec<u8>>,
        error: Option<RpcError>,
    },
}

impl Transaction {
    pub fn id(&self) -> u64 {
        match self {
            Transaction::Request { id, .. } | Transaction::Response { id, .. } => *id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn ok_response(id: u64, result: Vec<u8>) -> Self {
        Transaction::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err_response(id: u64, error: RpcError) -> Self {
        Transaction::Response {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Split `"service.method"` into its two parts.
///
/// Exactly one dot with non-empty text on both sides is required; anything
/// else is a `BadProcedure`.
pub fn parse_procedure(procedure: &str) -> Result<(&str, &str), RpcError> {
    let mut parts = procedure.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
            Ok((service, method))
        }
        _ => Err(RpcError::bad_procedure(procedure)),
    }
}

/// Encode a catalogue payload: the array of service names a node hosts.
pub fn encode_catalogue(names: &[String]) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(names)
}

/// Decode a catalogue payload.
pub fn decode_catalogue(bytes: &[u8]) -> Result<Vec<String>, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn request_round_trip_with_scope() {
        let tx = Transaction::Request {
            id: 42,
            scope: Some(7),
            procedure: "Echo.ping".into(),
            args: vec![1, 2, 3],
        };
        let bytes = tx.encode().unwrap();
        assert_eq!(Transaction::decode(&bytes).unwrap(), tx);
    }

    #[test]
    fn request_round_trip_without_scope() {
        let tx = Transaction::Request {
            id: 1,
            scope: None,
            procedure: "Stock.get".into(),
            args: vec![],
        };
        let bytes = tx.encode().unwrap();
        assert_eq!(Transaction::decode(&bytes).unwrap(), tx);
    }

    #[test]
    fn response_round_trip_all_optional_combinations() {
        for tx in [
            Transaction::ok_response(9, vec![0xAA]),
            Transaction::err_response(9, RpcError::no_route("Stock")),
            Transaction::Response {
                id: 9,
                result: None,
                error: None,
            },
        ] {
            let bytes = tx.encode().unwrap();
            assert_eq!(Transaction::decode(&bytes).unwrap(), tx);
        }
    }

    #[test]
    fn variant_tags_are_stable() {
        let req = Transaction::Request {
            id: 0,
            scope: None,
            procedure: "a.b".into(),
            args: vec![],
        };
        let resp = Transaction::ok_response(0, vec![]);
        // bincode writes the variant index as a little-endian u32 prefix.
        assert_eq!(&req.encode().unwrap()[..4], &[0, 0, 0, 0]);
        assert_eq!(&resp.encode().unwrap()[..4], &[1, 0, 0, 0]);
    }

    #[test]
    fn parse_procedure_accepts_the_two_part_form() {
        assert_eq!(parse_procedure("Echo.ping").unwrap(), ("Echo", "ping"));
        assert_eq!(parse_procedure("$scope.release").unwrap(), ("$scope", "release"));
    }

    #[test]
    fn malformed_procedures_are_rejected() {
        for bad in ["", "x", "x.y.z", ".m", "s.", "."] {
            let err = parse_procedure(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::BadProcedure, "input {bad:?}");
        }
    }

    #[test]
    fn catalogue_round_trip() {
        let names = vec!["Echo".to_string(), "Stock".to_string()];
        let bytes = encode_catalogue(&names).unwrap();
        assert_eq!(decode_catalogue(&bytes).unwrap(), names);

        let empty = encode_catalogue(&[]).unwrap();
        assert!(decode_catalogue(&empty).unwrap().is_empty());
    }
}

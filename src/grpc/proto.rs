//! Wire messages and generated service stubs for `ultra.UltraService`.

/// Greeting request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Payload to transform.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataRequest {
    #[prost(string, tag = "1")]
    pub data: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DataReply {
    #[prost(string, tag = "1")]
    pub processed: String,
}

include!(concat!(env!("OUT_DIR"), "/ultra.UltraService.rs"));

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_hello_request_wire_format() {
        let request = HelloRequest {
            name: "Ann".to_string(),
        };
        // Field 1, length-delimited.
        assert_eq!(request.encode_to_vec(), b"\x0a\x03Ann");
    }

    #[test]
    fn test_empty_message_decodes_to_default() {
        let reply = DataReply::decode(&b""[..]).unwrap();
        assert_eq!(reply.processed, "");
    }
}

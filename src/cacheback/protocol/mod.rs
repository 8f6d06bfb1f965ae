mod response;

pub use self::response::{
    is_version_reply, parse_response_header, ParseOutcome, ParsedHeader, ResponseKind,
    END_LITERAL, ENDLEN,
};

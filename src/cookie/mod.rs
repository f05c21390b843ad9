//! The session cookie: HMAC signing with rotating keys, attribute
//! serialization, and request-header parsing.

mod serialize;
mod sign;

pub use serialize::{
    expire_cookie, parse_set_cookie, request_cookie, serialize_cookie, ParsedCookie, SameSite,
    SerializeOptions,
};
pub use sign::CookieSigner;

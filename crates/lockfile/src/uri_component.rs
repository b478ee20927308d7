use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::borrow::Cow;

/// Characters left untouched by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encode a string the way `encodeURIComponent` does.
pub fn encode_uri_component(text: &str) -> Cow<'_, str> {
    utf8_percent_encode(text, URI_COMPONENT).into()
}

/// Reverse [`encode_uri_component`]. Invalid UTF-8 sequences are replaced.
pub fn decode_uri_component(text: &str) -> Cow<'_, str> {
    percent_decode_str(text).decode_utf8_lossy()
}

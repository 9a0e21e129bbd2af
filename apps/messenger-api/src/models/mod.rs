pub mod chat;
pub mod message;
pub mod reaction;
pub mod user;

pub(crate) fn serialize_i64_as_string<S: serde::Serializer>(val: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&val.to_string())
}

pub(crate) fn serialize_option_i64_as_string<S: serde::Serializer>(
    val: &Option<i64>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match val {
        Some(v) => s.serialize_some(&v.to_string()),
        None => s.serialize_none(),
    }
}

pub mod notification;
pub mod push_subscription;
pub mod user_status;

/// Snowflake ids leave JavaScript's safe integer range, so they go out as strings.
pub(crate) fn serialize_i64_as_string<S: serde::Serializer>(val: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&val.to_string())
}

//! Diesel table definitions for one user's sync authority. Each user gets
//! their own physical SQLite database (see `db::open_user_db`), so these
//! tables never carry a `user_id` column themselves.

diesel::table! {
    stored_ops (server_seq) {
        server_seq -> BigInt,
        id -> Text,
        client_id -> Text,
        op_type -> Text,
        entity_type -> Text,
        entity_id -> Nullable<Text>,
        payload -> Text,
        vector_clock -> Text,
        timestamp_ms -> BigInt,
        schema_version -> Integer,
        reason -> Nullable<Text>,
        received_at -> BigInt,
    }
}

diesel::table! {
    user_sync_state (id) {
        id -> Integer,
        session_id -> Text,
        storage_quota_used_bytes -> BigInt,
    }
}

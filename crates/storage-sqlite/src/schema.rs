//! Diesel table definitions mirroring the `SUP_OPS` object stores from the
//! wire/persistence spec onto SQLite tables.

diesel::table! {
    ops (seq) {
        seq -> BigInt,
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
        source -> Text,
        applied_at -> BigInt,
        synced_at -> Nullable<BigInt>,
        rejected_at -> Nullable<BigInt>,
        application_status -> Text,
        retry_count -> Integer,
    }
}

diesel::table! {
    state_cache (id) {
        id -> Integer,
        state -> Text,
        last_applied_op_seq -> BigInt,
        vector_clock -> Text,
        compacted_at -> BigInt,
        schema_version -> Integer,
        compaction_counter -> BigInt,
        entity_keys -> Text,
    }
}

diesel::table! {
    state_cache_backup (id) {
        id -> Integer,
        state -> Text,
        last_applied_op_seq -> BigInt,
        vector_clock -> Text,
        compacted_at -> BigInt,
        schema_version -> Integer,
        compaction_counter -> BigInt,
        entity_keys -> Text,
    }
}

diesel::table! {
    import_backup (id) {
        id -> Integer,
        snapshot -> Text,
        saved_at -> BigInt,
    }
}

diesel::table! {
    vector_clock_singleton (id) {
        id -> Integer,
        vector_clock -> Text,
    }
}

diesel::table! {
    archive_young (seq) {
        seq -> BigInt,
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
        archived_at -> BigInt,
    }
}

diesel::table! {
    archive_old (seq) {
        seq -> BigInt,
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
        archived_at -> BigInt,
    }
}

diesel::table! {
    compaction_state (id) {
        id -> Integer,
        counter -> BigInt,
    }
}

// Diesel table definitions. Kept in sync with `repository::migrations`.

diesel::table! {
    contexts (id) {
        id -> Text,
        status -> Text,
        template_id -> Nullable<Text>,
        organization_id -> Nullable<Text>,
        service_type -> Nullable<Text>,
        priority -> Integer,
        attempts -> Integer,
        last_attempt -> Nullable<Text>,
        next_retry_at -> Nullable<Text>,
        batch_id -> Nullable<Text>,
        tags -> Text,
        metadata -> Text,
        results -> Nullable<Text>,
        errors -> Text,
        worker_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
        processing_start -> Nullable<Text>,
        processing_end -> Nullable<Text>,
    }
}

diesel::table! {
    claim_locks (lock_key) {
        lock_key -> Text,
        owner -> Text,
        expires_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(contexts, claim_locks);

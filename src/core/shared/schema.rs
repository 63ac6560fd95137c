diesel::table! {
    patients (id) {
        id -> Uuid,
        name -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    operators (id) {
        id -> Uuid,
        name -> Text,
        role -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    patient_access (patient_id, operator_id) {
        patient_id -> Uuid,
        operator_id -> Uuid,
        can_view -> Bool,
        can_edit -> Bool,
        granted_by -> Uuid,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    sessions (id) {
        id -> Uuid,
        patient_id -> Uuid,
        operator_id -> Uuid,
        date -> Timestamptz,
        status -> Varchar,
        package_id -> Nullable<Uuid>,
        session_number -> Nullable<Int4>,
        total_sessions -> Nullable<Int4>,
        notes -> Nullable<Text>,
        complete_requested_by -> Nullable<Uuid>,
        complete_requested_at -> Nullable<Timestamptz>,
        complete_accepted_by -> Nullable<Uuid>,
        complete_accepted_at -> Nullable<Timestamptz>,
        delete_requested_by -> Nullable<Uuid>,
        delete_requested_at -> Nullable<Timestamptz>,
        delete_accepted_by -> Nullable<Uuid>,
        delete_accepted_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    session_questions (id) {
        id -> Uuid,
        session_id -> Uuid,
        patient_id -> Uuid,
        question -> Text,
        answer -> Nullable<Text>,
        answered_by -> Nullable<Uuid>,
        answered_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    session_files (id) {
        id -> Uuid,
        session_id -> Uuid,
        uploaded_by -> Uuid,
        file_name -> Text,
        storage_key -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    session_instructions (id) {
        id -> Uuid,
        session_id -> Uuid,
        operator_id -> Uuid,
        content -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    session_feedback (id) {
        id -> Uuid,
        session_id -> Uuid,
        patient_id -> Uuid,
        rating -> Int4,
        comment -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    audit_log (id) {
        id -> Uuid,
        seq -> Int8,
        actor_id -> Uuid,
        actor_type -> Varchar,
        action -> Varchar,
        resource_type -> Varchar,
        resource_id -> Text,
        details -> Jsonb,
        timestamp -> Timestamptz,
        previous_hash -> Nullable<Text>,
        hash -> Text,
    }
}

diesel::table! {
    device_tokens (token) {
        token -> Text,
        user_id -> Uuid,
        platform -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(session_questions -> sessions (session_id));
diesel::joinable!(session_files -> sessions (session_id));
diesel::joinable!(session_instructions -> sessions (session_id));
diesel::joinable!(session_feedback -> sessions (session_id));

diesel::allow_tables_to_appear_in_same_query!(
    patients,
    operators,
    patient_access,
    sessions,
    session_questions,
    session_files,
    session_instructions,
    session_feedback,
    audit_log,
    device_tokens,
);

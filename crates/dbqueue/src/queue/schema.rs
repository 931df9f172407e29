//! Column mapping of the queue table.
//!
//! Every name here ends up interpolated into generated SQL, so all of them
//! pass through [`sanitize_identifier`] on the way in.

/// Collapse every run of characters outside `[A-Za-z0-9]` into a single `_`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Like [`sanitize_identifier`] but keeps schema qualification (`schema.table`).
pub fn sanitize_table_name(name: &str) -> String {
    name.split('.')
        .map(sanitize_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

/// Built through [`QueueTableSchema::builder`]; fields are read-only so no
/// unsanitized name can reach the SQL builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTableSchema {
    id_field: String,
    queue_name_field: String,
    payload_field: String,
    created_at_field: String,
    next_process_at_field: String,
    attempt_field: String,
    reenqueue_attempt_field: String,
    total_attempt_field: String,
    extra_fields: Vec<String>,
}

impl Default for QueueTableSchema {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            queue_name_field: "queue_name".to_string(),
            payload_field: "payload".to_string(),
            created_at_field: "created_at".to_string(),
            next_process_at_field: "next_process_at".to_string(),
            attempt_field: "attempt".to_string(),
            reenqueue_attempt_field: "reenqueue_attempt".to_string(),
            total_attempt_field: "total_attempt".to_string(),
            extra_fields: Vec::new(),
        }
    }
}

impl QueueTableSchema {
    pub fn builder() -> QueueTableSchemaBuilder {
        QueueTableSchemaBuilder {
            schema: QueueTableSchema::default(),
        }
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn queue_name_field(&self) -> &str {
        &self.queue_name_field
    }

    pub fn payload_field(&self) -> &str {
        &self.payload_field
    }

    pub fn created_at_field(&self) -> &str {
        &self.created_at_field
    }

    pub fn next_process_at_field(&self) -> &str {
        &self.next_process_at_field
    }

    pub fn attempt_field(&self) -> &str {
        &self.attempt_field
    }

    pub fn reenqueue_attempt_field(&self) -> &str {
        &self.reenqueue_attempt_field
    }

    pub fn total_attempt_field(&self) -> &str {
        &self.total_attempt_field
    }

    /// Extension columns, mapped to `TaskRecord::ext_data` by name.
    pub fn extra_fields(&self) -> &[String] {
        &self.extra_fields
    }
}

pub struct QueueTableSchemaBuilder {
    schema: QueueTableSchema,
}

impl QueueTableSchemaBuilder {
    pub fn id_field(mut self, name: &str) -> Self {
        self.schema.id_field = sanitize_identifier(name);
        self
    }

    pub fn queue_name_field(mut self, name: &str) -> Self {
        self.schema.queue_name_field = sanitize_identifier(name);
        self
    }

    pub fn payload_field(mut self, name: &str) -> Self {
        self.schema.payload_field = sanitize_identifier(name);
        self
    }

    pub fn created_at_field(mut self, name: &str) -> Self {
        self.schema.created_at_field = sanitize_identifier(name);
        self
    }

    pub fn next_process_at_field(mut self, name: &str) -> Self {
        self.schema.next_process_at_field = sanitize_identifier(name);
        self
    }

    pub fn attempt_field(mut self, name: &str) -> Self {
        self.schema.attempt_field = sanitize_identifier(name);
        self
    }

    pub fn reenqueue_attempt_field(mut self, name: &str) -> Self {
        self.schema.reenqueue_attempt_field = sanitize_identifier(name);
        self
    }

    pub fn total_attempt_field(mut self, name: &str) -> Self {
        self.schema.total_attempt_field = sanitize_identifier(name);
        self
    }

    pub fn extra_field(mut self, name: &str) -> Self {
        let name = sanitize_identifier(name);
        if !self.schema.extra_fields.contains(&name) {
            self.schema.extra_fields.push(name);
        }
        self
    }

    pub fn build(self) -> QueueTableSchema {
        self.schema
    }
}

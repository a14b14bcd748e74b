//! Tantivy schema for indexed messages

use tantivy::schema::{
    FAST, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing,
    TextOptions,
};

/// Build the Tantivy schema for message documents
///
/// - uid: unique `{folder key}\u{1f}{message id}` term used for upserts
/// - mailbox_key, folder_key: exact-match filters
/// - subject, body_text, from, to, cc: full-text searchable
/// - received_at_ms: sort key, `i64::MIN` when unknown
pub fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field("uid", STRING | STORED);
    builder.add_text_field("mailbox_key", STRING);
    builder.add_text_field("folder_key", STRING);
    builder.add_text_field("folder", STRING | STORED);
    builder.add_text_field("message_id", STRING | STORED);

    builder.add_i64_field("context_id", STORED);
    builder.add_i64_field("user_id", STORED);
    builder.add_i64_field("account_id", STORED);

    builder.add_u64_field("flags", INDEXED | STORED | FAST);
    builder.add_i64_field("color_label", STORED);
    // Multi-valued
    builder.add_text_field("user_flags", STRING | STORED);

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_index_option(IndexRecordOption::WithFreqsAndPositions)
                .set_tokenizer("default"),
        )
        .set_stored();

    builder.add_text_field("subject", text_opts.clone());
    builder.add_text_field("body_text", text_opts.clone());
    builder.add_text_field("from", text_opts.clone());
    builder.add_text_field("to", text_opts.clone());
    builder.add_text_field("cc", text_opts);

    builder.add_i64_field("received_at_ms", FAST | STORED);
    builder.add_u64_field("size", STORED);
    builder.add_u64_field("has_attachment", STORED);

    builder.build()
}

/// Field handles for indexing and searching
pub struct SchemaFields {
    pub uid: Field,
    pub mailbox_key: Field,
    pub folder_key: Field,
    pub folder: Field,
    pub message_id: Field,
    pub context_id: Field,
    pub user_id: Field,
    pub account_id: Field,
    pub flags: Field,
    pub color_label: Field,
    pub user_flags: Field,
    pub subject: Field,
    pub body_text: Field,
    pub from: Field,
    pub to: Field,
    pub cc: Field,
    pub received_at_ms: Field,
    pub size: Field,
    pub has_attachment: Field,
}

impl SchemaFields {
    /// Resolve handles against a schema from [`build_schema`]
    pub fn new(schema: &Schema) -> tantivy::Result<Self> {
        Ok(Self {
            uid: schema.get_field("uid")?,
            mailbox_key: schema.get_field("mailbox_key")?,
            folder_key: schema.get_field("folder_key")?,
            folder: schema.get_field("folder")?,
            message_id: schema.get_field("message_id")?,
            context_id: schema.get_field("context_id")?,
            user_id: schema.get_field("user_id")?,
            account_id: schema.get_field("account_id")?,
            flags: schema.get_field("flags")?,
            color_label: schema.get_field("color_label")?,
            user_flags: schema.get_field("user_flags")?,
            subject: schema.get_field("subject")?,
            body_text: schema.get_field("body_text")?,
            from: schema.get_field("from")?,
            to: schema.get_field("to")?,
            cc: schema.get_field("cc")?,
            received_at_ms: schema.get_field("received_at_ms")?,
            size: schema.get_field("size")?,
            has_attachment: schema.get_field("has_attachment")?,
        })
    }

    pub fn text_fields(&self) -> Vec<Field> {
        vec![self.subject, self.body_text, self.from, self.to, self.cc]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_resolve() {
        let schema = build_schema();
        let fields = SchemaFields::new(&schema).unwrap();
        assert_ne!(fields.uid, fields.folder_key);
        assert_eq!(fields.text_fields().len(), 5);
    }
}

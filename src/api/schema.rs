use utoipa::openapi::{ArrayBuilder, ObjectBuilder, OneOfBuilder, RefOr, Schema, SchemaType};
use utoipa::ToSchema;

use crate::network::message::GossipMessage;

/// OpenAPI description of the adjacently tagged gossip envelope
///
/// `{"kind": "block", "payload": Block}` or
/// `{"kind": "chain", "payload": [Block, ...]}`
impl<'s> ToSchema<'s> for GossipMessage {
    fn schema() -> (&'s str, RefOr<Schema>) {
        let block = || RefOr::Ref(utoipa::openapi::Ref::from_schema_name("Block"));
        let variant = |kind: &str, payload: RefOr<Schema>| {
            ObjectBuilder::new()
                .property(
                    "kind",
                    ObjectBuilder::new()
                        .schema_type(SchemaType::String)
                        .enum_values(Some([kind.to_string()])),
                )
                .required("kind")
                .property("payload", payload)
                .required("payload")
        };

        let schema = OneOfBuilder::new()
            .item(variant("block", block()))
            .item(variant("chain", ArrayBuilder::new().items(block()).into()))
            .description(Some("A block or a chain snapshot announced by a peer"));

        ("GossipMessage", schema.into())
    }
}

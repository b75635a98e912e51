//! A compact, embeddable protobuf wire-format runtime driven by a
//! compressed [`MiniTable`] schema: parse one, decode/encode messages
//! against it, and promote unlinked sub-messages once their schema becomes
//! known.
//!
//! Module layout (`arena`, `containers`, `wire`, `utils`) generalizes a
//! compile-time generated dispatch table approach to the runtime
//! `MiniTable` model described in `hpb/mini_table/*`.

pub mod arena;
pub mod containers;
pub mod decode;
pub mod encode;
pub mod message;
pub mod mini_descriptor;
pub mod minitable;
pub mod promote;
pub mod status;
mod utils;
pub mod wire;

pub use arena::Arena;
pub use message::{Message, TaggedMessagePtr};
pub use minitable::{
    ExtensionRegistry, FieldType, MiniTable, MiniTableEnum, MiniTableExtension, MiniTableField,
    Mode, Presence,
};
pub use status::{DecodeOptions, DecodeStatus, EncodeOptions, EncodeStatus, Status};
#[cfg(feature = "std")]
pub use status::StatusExt;

pub use decode::decode_message;
pub use encode::encode_message;
pub use promote::{promote_array, promote_map, promote_message};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mini_descriptor::{decode_message_descriptor, encode_message_descriptor, FieldSpec, MessageSpec};

    fn int32_field(number: u32, required: bool) -> FieldSpec {
        FieldSpec {
            number,
            field_type: FieldType::Int32,
            mode: Mode::Scalar,
            packed: false,
            required,
            proto3_singular: false,
        }
    }

    /// End-to-end: build a schema from a `MiniDescriptor`, decode wire bytes
    /// against it, then encode back and check it round-trips.
    #[test]
    fn decode_then_encode_round_trips() {
        let spec = MessageSpec {
            fields: vec![int32_field(1, true), int32_field(2, false)],
            ..Default::default()
        };
        let descriptor = encode_message_descriptor(&spec);
        let mt: &'static MiniTable = Box::leak(Box::new(decode_message_descriptor(&descriptor).unwrap()));

        let mut buf = Vec::new();
        wire::write_varint(&mut buf, (1 << 3) | 0);
        wire::write_varint(&mut buf, 42);
        wire::write_varint(&mut buf, (2 << 3) | 0);
        wire::write_varint(&mut buf, 9);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, mt.size as usize).unwrap();
        let status = decode_message(&buf, &msg, mt, None, DecodeOptions::new().with_check_required(), &arena);
        assert_eq!(status, DecodeStatus::Ok);

        let out = encode_message(&msg, mt, None, EncodeOptions::new()).unwrap();
        assert_eq!(out, buf);
    }
}

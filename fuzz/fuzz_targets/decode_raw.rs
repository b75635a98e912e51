#![no_main]

use libfuzzer_sys::fuzz_target;
use minipb::mini_descriptor::{decode_message_descriptor, encode_message_descriptor, FieldSpec, MessageSpec};
use minipb::{Arena, DecodeOptions, FieldType, Message, MiniTable, Mode};
use std::sync::OnceLock;

fn scalar_field(number: u32, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        number,
        field_type,
        mode: Mode::Scalar,
        packed: false,
        required: false,
        proto3_singular: true,
    }
}

fn array_field(number: u32, field_type: FieldType, packed: bool) -> FieldSpec {
    FieldSpec {
        number,
        field_type,
        mode: Mode::Array,
        packed,
        required: false,
        proto3_singular: false,
    }
}

/// A schema covering every non-map, non-extension field shape so arbitrary
/// wire bytes exercise scalar, array, and sub-message decode paths.
fn schema() -> &'static MiniTable {
    static MT: OnceLock<&'static MiniTable> = OnceLock::new();
    *MT.get_or_init(|| {
        let child_spec = MessageSpec {
            fields: vec![scalar_field(1, FieldType::Int32)],
            ..Default::default()
        };
        let child_mt: &'static MiniTable =
            Box::leak(Box::new(decode_message_descriptor(&encode_message_descriptor(&child_spec)).unwrap()));

        let spec = MessageSpec {
            fields: vec![
                scalar_field(1, FieldType::Int32),
                scalar_field(2, FieldType::UInt64),
                scalar_field(3, FieldType::Bytes),
                scalar_field(4, FieldType::Message),
                array_field(5, FieldType::Int32, true),
                array_field(6, FieldType::String, false),
            ],
            ..Default::default()
        };
        let mt: &'static MiniTable =
            Box::leak(Box::new(decode_message_descriptor(&encode_message_descriptor(&spec)).unwrap()));
        mt.set_sub_message(&mt.fields[3], child_mt as *const MiniTable as *mut MiniTable);
        mt
    })
}

fuzz_target!(|data: &[u8]| {
    let mt = schema();
    let arena = Arena::new();
    let Some(msg) = Message::new_in(&arena, mt.size as usize) else {
        return;
    };
    let _ = minipb::decode_message(data, &msg, mt, None, DecodeOptions::new(), &arena);
});

//! Promotion: once a sub-message's `MiniTable` is linked via
//! `MiniTable::set_sub_message`, a previously-unlinked placeholder
//! (§3.3: a [`TaggedMessagePtr`] with its empty bit set) can be turned into
//! a real instance of the now-known type by re-parsing its captured raw
//! bytes — the same bytes `decode::decode_unknown_field` appended while the
//! field was still unlinked, since `decode_fields` against
//! `minitable::empty_mini_table()` treats every tag as unknown.
//!
//! Grounded on `hpb/message/promote.h`'s three entry points (scalar, array,
//! map); the re-decode itself reuses [`crate::decode::decode_message`]
//! rather than duplicating field-dispatch logic.

use crate::arena::Arena;
use crate::containers::{MapField, RepeatedStorage};
use crate::decode::decode_message;
use crate::message::{Message, TaggedMessagePtr};
use crate::minitable::{ExtensionRegistry, MiniTable, MiniTableField};
use crate::status::{DecodeOptions, DecodeStatus};

/// Promote a scalar sub-message field, if present and still unlinked.
/// A no-op if the field is absent, already promoted, or the schema still has
/// no link for it (in which case `UnlinkedSubMessage` is returned so callers
/// can tell "nothing to promote" from "link it first").
pub fn promote_message(
    msg: &Message,
    field: &'static MiniTableField,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
) -> DecodeStatus {
    let ptr = *msg.ref_at::<usize>(field.offset);
    if ptr == 0 {
        return DecodeStatus::Ok;
    }
    let tp = unsafe { &mut *(ptr as *mut TaggedMessagePtr) };
    if !tp.is_empty() {
        return DecodeStatus::Ok;
    }
    if !mt.is_sub_linked(field) {
        return DecodeStatus::UnlinkedSubMessage;
    }
    promote_one(tp, mt.sub_message(field), extreg, options, arena)
}

/// Promote every still-unlinked element of a repeated sub-message field.
pub fn promote_array(
    msg: &Message,
    field: &'static MiniTableField,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
) -> DecodeStatus {
    let ptr = *msg.ref_at::<usize>(field.offset);
    if ptr == 0 {
        return DecodeStatus::Ok;
    }
    let storage = unsafe { &mut *(ptr as *mut RepeatedStorage) };
    let RepeatedStorage::Message(arr) = storage else {
        return DecodeStatus::Ok;
    };
    if !mt.is_sub_linked(field) {
        return DecodeStatus::UnlinkedSubMessage;
    }
    let sub_mt = mt.sub_message(field);
    for tp in arr.as_mut_slice() {
        if tp.is_empty() {
            let status = promote_one(tp, sub_mt, extreg, options, arena);
            if !status.is_recoverable() {
                return status;
            }
        }
    }
    DecodeStatus::Ok
}

/// Promote every still-unlinked message-typed value of a `map<K, Message>`
/// field. The map's own storage (key bytes, value address bytes) never
/// changes shape — only the pointed-to `TaggedMessagePtr` is rewritten in
/// place — so this needs no mutable access to [`MapField`] itself.
pub fn promote_map(
    msg: &Message,
    field: &'static MiniTableField,
    mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
) -> DecodeStatus {
    let ptr = *msg.ref_at::<usize>(field.offset);
    if ptr == 0 {
        return DecodeStatus::Ok;
    }
    let map = unsafe { &*(ptr as *const MapField) };
    let entry_mt = mt.sub_message(field);
    let value_field = &entry_mt.fields[1];
    if !value_field.field_type.is_submessage() {
        return DecodeStatus::Ok;
    }
    if !entry_mt.is_sub_linked(value_field) {
        return DecodeStatus::UnlinkedSubMessage;
    }
    let value_mt = entry_mt.sub_message(value_field);
    for (_key, value_bytes) in map.iter() {
        let addr = usize::from_le_bytes(value_bytes[..8].try_into().unwrap());
        let tp = unsafe { &mut *(addr as *mut TaggedMessagePtr) };
        if tp.is_empty() {
            let status = promote_one(tp, value_mt, extreg, options, arena);
            if !status.is_recoverable() {
                return status;
            }
        }
    }
    DecodeStatus::Ok
}

fn promote_one(
    tp: &mut TaggedMessagePtr,
    sub_mt: &'static MiniTable,
    extreg: Option<&ExtensionRegistry>,
    options: DecodeOptions,
    arena: &Arena,
) -> DecodeStatus {
    let raw = tp.message().unknown_bytes();
    let Some(promoted) = Message::new_in(arena, sub_mt.size as usize) else {
        return DecodeStatus::OutOfMemory;
    };
    let status = decode_message(&raw, &promoted, sub_mt, extreg, options, arena);
    if !status.is_recoverable() {
        log::warn!("promote: re-decode of captured bytes failed: {status}");
        return status;
    }
    tp.set_promoted(promoted);
    log::debug!("promote: linked a previously-empty sub-message ({} bytes)", raw.len());
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minitable::{Extendability, FieldFlags, FieldType, Mode, Presence, Rep, Sub};
    use crate::wire;
    use std::sync::atomic::AtomicPtr;

    fn leak(mt: MiniTable) -> &'static MiniTable {
        Box::leak(Box::new(mt))
    }

    #[test]
    fn promotes_scalar_submessage_after_linking() {
        let mut inner_field = MiniTableField {
            number: 1,
            offset: 8,
            presence: 0,
            sub_index: 0,
            mode: Mode::Scalar,
            rep: Rep::FourByte,
            flags: FieldFlags::empty(),
            field_type: FieldType::Int32,
        };
        inner_field.set_presence(Presence::Hasbit(1));
        let inner_mt = leak(MiniTable {
            fields: vec![inner_field],
            subs: vec![],
            size: 16,
            required_count: 0,
            dense_below: 1,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: false,
        });

        let mut outer_field = MiniTableField {
            number: 1,
            offset: 8,
            presence: 0,
            sub_index: 0,
            mode: Mode::Scalar,
            rep: Rep::Pointer,
            flags: FieldFlags::empty(),
            field_type: FieldType::Message,
        };
        outer_field.set_presence(Presence::Hasbit(1));
        let mut outer_mt = MiniTable {
            fields: vec![outer_field],
            subs: vec![Sub::Message(AtomicPtr::new(core::ptr::null_mut()))],
            size: 16,
            required_count: 0,
            dense_below: 1,
            table_mask: 0,
            ext: Extendability::NonExtendable,
            validate_utf8: false,
        };
        outer_mt.fields[0].sub_index = 0;
        let outer_mt = leak(outer_mt);

        let mut body = Vec::new();
        wire::write_varint(&mut body, (1 << 3) | 0);
        wire::write_varint(&mut body, 7);
        let mut buf = Vec::new();
        wire::write_varint(&mut buf, (1 << 3) | 2);
        wire::write_varint(&mut buf, body.len() as u64);
        buf.extend_from_slice(&body);

        let arena = Arena::new();
        let msg = Message::new_in(&arena, 16).unwrap();
        let status = decode_message(&buf, &msg, outer_mt, None, DecodeOptions::new(), &arena);
        assert_eq!(status, DecodeStatus::UnlinkedSubMessage);

        outer_mt.set_sub_message(&outer_mt.fields[0], inner_mt as *const MiniTable as *mut MiniTable);
        let status = promote_message(&msg, &outer_mt.fields[0], outer_mt, None, DecodeOptions::new(), &arena);
        assert!(status.is_ok());

        let ptr = *msg.ref_at::<usize>(8);
        let tp = unsafe { &*(ptr as *const TaggedMessagePtr) };
        assert!(!tp.is_empty());
        assert_eq!(*tp.message().ref_at::<i32>(8), 7);
    }
}

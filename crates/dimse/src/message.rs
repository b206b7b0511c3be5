//! DIMSE messages: command sets, their wire encoding and PDV reassembly

use bytes::{Bytes, BytesMut};
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

use crate::error::{DimseError, Result};
use crate::pdu::{PDataValue, PDataValueType};
use crate::types::{CommandField, DimseStatus, Priority};

/// Command Data Set Type value meaning "no data set follows"
pub const NO_DATA_SET: u16 = 0x0101;

/// Command Data Set Type value used when a data set follows
pub const DATA_SET_PRESENT: u16 = 0x0000;

/// Sub-operation tallies reported by C-MOVE responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// A DIMSE command set, always encoded as implicit VR little endian
#[derive(Debug, Clone)]
pub struct CommandSet {
    obj: InMemDicomObject,
}

fn us(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

fn ui(tag: Tag, value: &str) -> InMemElement {
    DataElement::new(tag, VR::UI, dicom_value!(Str, value))
}

impl CommandSet {
    fn from_elements<I>(elements: I) -> Self
    where
        I: IntoIterator<Item = InMemElement>,
    {
        Self {
            obj: InMemDicomObject::command_from_element_iter(elements),
        }
    }

    pub fn echo_rq(message_id: u16) -> Self {
        Self::from_elements([
            ui(tags::AFFECTED_SOP_CLASS_UID, crate::sop_class::VERIFICATION),
            us(tags::COMMAND_FIELD, CommandField::CEchoRq.code()),
            us(tags::MESSAGE_ID, message_id),
            us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        ])
    }

    /// C-STORE-RQ; `move_originator` is set when the store is a C-MOVE sub-operation
    pub fn store_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        priority: Priority,
        move_originator: Option<(&str, u16)>,
    ) -> Self {
        let mut elements = vec![
            ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
            us(tags::COMMAND_FIELD, CommandField::CStoreRq.code()),
            us(tags::MESSAGE_ID, message_id),
            us(tags::PRIORITY, priority.code()),
            us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
            ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
        ];
        if let Some((ae_title, originator_id)) = move_originator {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, ae_title),
            ));
            elements.push(us(tags::MOVE_ORIGINATOR_MESSAGE_ID, originator_id));
        }
        Self::from_elements(elements)
    }

    pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        Self::from_elements([
            ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
            us(tags::COMMAND_FIELD, CommandField::CFindRq.code()),
            us(tags::MESSAGE_ID, message_id),
            us(tags::PRIORITY, priority.code()),
            us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
        ])
    }

    pub fn move_rq(
        message_id: u16,
        sop_class_uid: &str,
        destination: &str,
        priority: Priority,
    ) -> Self {
        Self::from_elements([
            ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
            us(tags::COMMAND_FIELD, CommandField::CMoveRq.code()),
            us(tags::MESSAGE_ID, message_id),
            us(tags::PRIORITY, priority.code()),
            us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
            DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, destination)),
        ])
    }

    pub fn cancel_rq(message_id_being_responded_to: u16) -> Self {
        Self::from_elements([
            us(tags::COMMAND_FIELD, CommandField::CCancelRq.code()),
            us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id_being_responded_to),
            us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        ])
    }

    /// Response command answering a request
    pub fn response(
        command_field: CommandField,
        message_id_being_responded_to: u16,
        sop_class_uid: Option<&str>,
        sop_instance_uid: Option<&str>,
        status: DimseStatus,
        has_data_set: bool,
    ) -> Self {
        let mut elements = Vec::with_capacity(6);
        if let Some(uid) = sop_class_uid {
            elements.push(ui(tags::AFFECTED_SOP_CLASS_UID, uid));
        }
        elements.push(us(tags::COMMAND_FIELD, command_field.code()));
        elements.push(us(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            message_id_being_responded_to,
        ));
        elements.push(us(
            tags::COMMAND_DATA_SET_TYPE,
            if has_data_set { DATA_SET_PRESENT } else { NO_DATA_SET },
        ));
        elements.push(us(tags::STATUS, status.code()));
        if let Some(uid) = sop_instance_uid {
            elements.push(ui(tags::AFFECTED_SOP_INSTANCE_UID, uid));
        }
        Self::from_elements(elements)
    }

    /// Adds the four sub-operation counters of a C-MOVE response
    pub fn with_sub_operations(mut self, counts: SubOperations) -> Self {
        self.obj
            .put(us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, counts.remaining));
        self.obj
            .put(us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, counts.completed));
        self.obj
            .put(us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, counts.failed));
        self.obj
            .put(us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, counts.warning));
        self.refresh_group_length();
        self
    }

    pub fn with_error_comment(mut self, comment: &str) -> Self {
        // Error Comment is LO, at most 64 characters
        let comment: String = comment.chars().take(64).collect();
        self.obj.put(DataElement::new(
            tags::ERROR_COMMENT,
            VR::LO,
            PrimitiveValue::from(comment),
        ));
        self.refresh_group_length();
        self
    }

    fn refresh_group_length(&mut self) {
        let elements: Vec<_> = self
            .obj
            .iter()
            .filter(|e| e.header().tag != tags::COMMAND_GROUP_LENGTH)
            .cloned()
            .collect();
        self.obj = InMemDicomObject::command_from_element_iter(elements);
    }

    fn u16_of(&self, tag: Tag) -> Option<u16> {
        self.obj.element(tag).ok()?.to_int::<u16>().ok()
    }

    fn str_of(&self, tag: Tag) -> Option<String> {
        let value = self.obj.element(tag).ok()?.to_str().ok()?;
        let value = value
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .trim_start();
        Some(value.to_string())
    }

    pub fn command_field(&self) -> Result<CommandField> {
        let code = self
            .u16_of(tags::COMMAND_FIELD)
            .ok_or_else(|| DimseError::DicomParsing("missing Command Field".to_string()))?;
        CommandField::from_code(code).ok_or_else(|| {
            DimseError::NotSupported(format!("command field 0x{:04X}", code))
        })
    }

    pub fn message_id(&self) -> Option<u16> {
        self.u16_of(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        self.u16_of(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.str_of(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.str_of(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.str_of(tags::MOVE_DESTINATION)
    }

    pub fn move_originator(&self) -> Option<(String, u16)> {
        Some((
            self.str_of(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)?,
            self.u16_of(tags::MOVE_ORIGINATOR_MESSAGE_ID)?,
        ))
    }

    pub fn priority(&self) -> Priority {
        self.u16_of(tags::PRIORITY)
            .map(Priority::from_code)
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<DimseStatus> {
        self.u16_of(tags::STATUS).map(DimseStatus::from_code)
    }

    pub fn error_comment(&self) -> Option<String> {
        self.str_of(tags::ERROR_COMMENT)
    }

    pub fn sub_operations(&self) -> Option<SubOperations> {
        Some(SubOperations {
            remaining: self.u16_of(tags::NUMBER_OF_REMAINING_SUBOPERATIONS).unwrap_or(0),
            completed: self.u16_of(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)?,
            failed: self.u16_of(tags::NUMBER_OF_FAILED_SUBOPERATIONS)?,
            warning: self.u16_of(tags::NUMBER_OF_WARNING_SUBOPERATIONS)?,
        })
    }

    pub fn has_data_set(&self) -> bool {
        self.u16_of(tags::COMMAND_DATA_SET_TYPE)
            .map(|kind| kind != NO_DATA_SET)
            .unwrap_or(false)
    }

    pub fn as_object(&self) -> &InMemDicomObject {
        &self.obj
    }

    pub fn encode(&self) -> Result<Bytes> {
        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut buf = Vec::with_capacity(128);
        self.obj
            .write_dataset_with_ts(&mut buf, &ts)
            .map_err(|e| DimseError::DicomEncoding(format!("command set: {}", e)))?;
        Ok(Bytes::from(buf))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(data, &ts)
            .map_err(|e| DimseError::DicomParsing(format!("command set: {}", e)))?;
        Ok(Self { obj })
    }
}

/// A complete DIMSE message as exchanged on one presentation context
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub data: Option<Bytes>,
}

impl DimseMessage {
    pub fn new(presentation_context_id: u8, command: CommandSet, data: Option<Bytes>) -> Self {
        Self {
            presentation_context_id,
            command,
            data,
        }
    }

    /// Splits the message into PDV fragments carrying at most `max_fragment` bytes each
    pub fn into_fragments(self, max_fragment: usize) -> Result<Vec<PDataValue>> {
        let max_fragment = max_fragment.max(1);
        let mut values = Vec::new();
        push_fragments(
            &mut values,
            self.presentation_context_id,
            PDataValueType::Command,
            self.command.encode()?,
            max_fragment,
        );
        if let Some(data) = self.data {
            push_fragments(
                &mut values,
                self.presentation_context_id,
                PDataValueType::Data,
                data,
                max_fragment,
            );
        }
        Ok(values)
    }
}

fn push_fragments(
    values: &mut Vec<PDataValue>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    mut payload: Bytes,
    max_fragment: usize,
) {
    loop {
        let chunk = payload.split_to(payload.len().min(max_fragment));
        let is_last = payload.is_empty();
        values.push(PDataValue {
            presentation_context_id,
            value_type: value_type.clone(),
            is_last,
            data: chunk.to_vec(),
        });
        if is_last {
            break;
        }
    }
}

/// Rebuilds DIMSE messages from a sequence of PDV fragments
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command_buf: BytesMut,
    command: Option<CommandSet>,
    data_buf: BytesMut,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a message is partially received
    pub fn in_progress(&self) -> bool {
        self.presentation_context_id.is_some()
    }

    /// Feeds one fragment, returning the message it completes, if any
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        match self.presentation_context_id {
            Some(id) if id != pdv.presentation_context_id => {
                return Err(DimseError::malformed(format!(
                    "fragment for presentation context {} interleaved with context {}",
                    pdv.presentation_context_id, id
                )));
            }
            _ => self.presentation_context_id = Some(pdv.presentation_context_id),
        }

        match pdv.value_type {
            PDataValueType::Command => {
                if self.command.is_some() {
                    return Err(DimseError::malformed(
                        "command fragment after a complete command set",
                    ));
                }
                self.command_buf.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let command = CommandSet::decode(&self.command_buf)?;
                self.command_buf.clear();
                if command.has_data_set() {
                    self.command = Some(command);
                    Ok(None)
                } else {
                    Ok(Some(self.finish(command, None)))
                }
            }
            PDataValueType::Data => {
                let Some(command) = self.command.take() else {
                    return Err(DimseError::malformed("data fragment before its command set"));
                };
                self.data_buf.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    self.command = Some(command);
                    return Ok(None);
                }
                let data = std::mem::take(&mut self.data_buf).freeze();
                Ok(Some(self.finish(command, Some(data))))
            }
        }
    }

    fn finish(&mut self, command: CommandSet, data: Option<Bytes>) -> DimseMessage {
        let presentation_context_id = self.presentation_context_id.take().unwrap_or_default();
        DimseMessage {
            presentation_context_id,
            command,
            data,
        }
    }
}

/// Parses a data set received on a presentation context with the given transfer syntax
pub fn read_data_set(data: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry.get(transfer_syntax_uid).ok_or_else(|| {
        DimseError::NotSupported(format!("transfer syntax {}", transfer_syntax_uid))
    })?;
    InMemDicomObject::read_dataset_with_ts(data, ts)
        .map_err(|e| DimseError::DicomParsing(format!("data set: {}", e)))
}

/// Encodes a data set with the given transfer syntax
pub fn write_data_set(obj: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Bytes> {
    let ts = TransferSyntaxRegistry.get(transfer_syntax_uid).ok_or_else(|| {
        DimseError::NotSupported(format!("transfer syntax {}", transfer_syntax_uid))
    })?;
    let mut buf = Vec::new();
    obj.write_dataset_with_ts(&mut buf, ts)
        .map_err(|e| DimseError::DicomEncoding(format!("data set: {}", e)))?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_rq_fields() {
        let cmd = CommandSet::store_rq(
            7,
            "1.2.840.10008.5.1.4.1.1.7",
            "1.2.3.4.5",
            Priority::High,
            Some(("MUPACS", 3)),
        );
        let decoded = CommandSet::decode(&cmd.encode().unwrap()).unwrap();

        assert_eq!(decoded.command_field().unwrap(), CommandField::CStoreRq);
        assert_eq!(decoded.message_id(), Some(7));
        assert_eq!(decoded.priority(), Priority::High);
        assert!(decoded.has_data_set());
        assert_eq!(
            decoded.affected_sop_instance_uid().as_deref(),
            Some("1.2.3.4.5")
        );
        assert_eq!(
            decoded.move_originator(),
            Some(("MUPACS".to_string(), 3))
        );
    }

    #[test]
    fn test_move_response_counts_and_comment() {
        let cmd = CommandSet::response(
            CommandField::CMoveRsp,
            9,
            Some("1.2.840.10008.5.1.4.1.2.2.2"),
            None,
            DimseStatus::Failure(0xA801),
            false,
        )
        .with_sub_operations(SubOperations::default())
        .with_error_comment("unknown destination NOWHERE");

        let decoded = CommandSet::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded.status(), Some(DimseStatus::Failure(0xA801)));
        assert_eq!(decoded.message_id_being_responded_to(), Some(9));
        assert_eq!(decoded.sub_operations(), Some(SubOperations::default()));
        assert_eq!(
            decoded.error_comment().as_deref(),
            Some("unknown destination NOWHERE")
        );
        assert!(!decoded.has_data_set());
    }

    #[test]
    fn test_reassembly_across_fragments() {
        let message = DimseMessage::new(
            5,
            CommandSet::find_rq(1, "1.2.840.10008.5.1.4.1.2.2.1", Priority::Medium),
            Some(Bytes::from(vec![0xAB; 100])),
        );
        let fragments = message.into_fragments(16).unwrap();
        assert!(fragments.len() > 2);
        assert!(fragments.iter().all(|f| f.data.len() <= 16));

        let mut assembler = MessageAssembler::new();
        let mut complete = None;
        for fragment in fragments {
            assert!(complete.is_none());
            complete = assembler.push(fragment).unwrap();
        }
        let complete = complete.unwrap();
        assert_eq!(complete.presentation_context_id, 5);
        assert_eq!(complete.command.command_field().unwrap(), CommandField::CFindRq);
        assert_eq!(complete.data.unwrap().len(), 100);
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_data_before_command_is_rejected() {
        let mut assembler = MessageAssembler::new();
        let result = assembler.push(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: b"\0\0".to_vec(),
        });
        assert!(matches!(result, Err(DimseError::MalformedPdu(_))));
    }

    #[test]
    fn test_echo_completes_without_data() {
        let fragments = DimseMessage::new(1, CommandSet::echo_rq(42), None)
            .into_fragments(16_384)
            .unwrap();
        assert_eq!(fragments.len(), 1);

        let mut assembler = MessageAssembler::new();
        let message = assembler
            .push(fragments.into_iter().next().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(message.command.message_id(), Some(42));
        assert!(message.data.is_none());
    }
}

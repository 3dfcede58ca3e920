use crate::message::{MessageTemplate, MidiMessage, BYTE_VALUE_MAX};
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_MAPPING_NAME: usize = 24;
pub const MAX_SET_SLOTS: usize = 4;

pub type MappingName = ArrayString<MAX_MAPPING_NAME>;

/// Stable identity of a parameter mapping within one registry.
///
/// Identity is by name: repeated [`MappingRegistry::get_or_create`] calls with
/// the same name return the same id, so independent consumers share one stored
/// value and trigger one set of wire traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingId(pub(crate) u16);

/// One logical device parameter: wire templates plus the current value.
///
/// The `set` side is a normalized fixed-length slot sequence (length 1 for
/// scalar mappings); multi-slot mappings drive several wire messages from one
/// logical parameter. A mapping without a `request` message is set-only; a
/// mapping without a `response` template adopts sent values immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterMapping {
    name: MappingName,
    set: Vec<MessageTemplate, MAX_SET_SLOTS>,
    request: Option<MidiMessage>,
    response: Option<MessageTemplate>,
    value: Option<u16>,
}

impl ParameterMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_slots(&self) -> &[MessageTemplate] {
        &self.set
    }

    pub fn slot_count(&self) -> usize {
        self.set.len()
    }

    pub fn request(&self) -> Option<&MidiMessage> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&MessageTemplate> {
        self.response.as_ref()
    }

    /// Current synchronized value. `None` until the first matched response,
    /// and again after a request timed out.
    pub fn value(&self) -> Option<u16> {
        self.value
    }

    /// Whether this mapping carries 14-bit values, derived from the first set
    /// slot (mixed-precision slot lists are not a thing on real devices).
    pub fn is_extended(&self) -> bool {
        self.set.first().is_some_and(MessageTemplate::is_extended)
    }

    pub fn max_value(&self) -> u16 {
        self.set
            .first()
            .map_or(BYTE_VALUE_MAX, MessageTemplate::max_value)
    }

    pub(crate) fn store_value(&mut self, value: u16) {
        self.value = Some(value);
    }

    pub(crate) fn clear_value(&mut self) {
        self.value = None;
    }
}

#[derive(Debug, Default)]
pub struct MappingRegistry {
    mappings: std::vec::Vec<ParameterMapping>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of the mapping named `name`, creating it on first use.
    ///
    /// The templates are only consulted on creation; a second caller asking
    /// for an existing name gets the original definition back regardless of
    /// what it passes. Names longer than [`MAX_MAPPING_NAME`] or more than
    /// [`MAX_SET_SLOTS`] set templates are definition errors.
    pub fn get_or_create(
        &mut self,
        name: &str,
        set: &[MessageTemplate],
        request: Option<MidiMessage>,
        response: Option<MessageTemplate>,
    ) -> Result<MappingId, RegistryError> {
        if let Some(index) = self.mappings.iter().position(|m| m.name() == name) {
            return Ok(MappingId(index as u16));
        }

        let name = MappingName::from(name).map_err(|_| RegistryError::NameTooLong)?;
        if set.is_empty() {
            return Err(RegistryError::NoSetTemplate);
        }
        let mut slots = Vec::new();
        for template in set {
            slots
                .push(template.clone())
                .map_err(|_| RegistryError::TooManySetSlots)?;
        }

        self.mappings.push(ParameterMapping {
            name,
            set: slots,
            request,
            response,
            value: None,
        });

        Ok(MappingId((self.mappings.len() - 1) as u16))
    }

    pub fn get(&self, id: MappingId) -> &ParameterMapping {
        &self.mappings[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: MappingId) -> &mut ParameterMapping {
        &mut self.mappings[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = MappingId> {
        (0..self.mappings.len() as u16).map(MappingId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("mapping name exceeds {MAX_MAPPING_NAME} bytes")]
    NameTooLong,
    #[error("mapping defines no set template")]
    NoSetTemplate,
    #[error("mapping defines more than {MAX_SET_SLOTS} set templates")]
    TooManySetSlots,
}

use rmpv::Value;

use crate::message::{DecodeError, Values};

/// Per-variant view over a decoded payload map.
///
/// Every accessor marks the field it reads as consumed; [`Fields::finish`]
/// rejects whatever was left over, so a payload must match the variant's
/// schema exactly.
pub(crate) struct Fields<'a> {
    ty: &'static str,
    entries: &'a [(Value, Value)],
    taken: Vec<bool>,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(ty: &'static str, entries: &'a [(Value, Value)]) -> Self {
        Self {
            ty,
            entries,
            taken: vec![false; entries.len()],
        }
    }

    fn take(&mut self, name: &'static str) -> Option<&'a Value> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .position(|(idx, (key, _))| !self.taken[idx] && key.as_str() == Some(name))?;
        self.taken[idx] = true;
        match &self.entries[idx].1 {
            Value::Nil => None,
            value => Some(value),
        }
    }

    fn missing(&self, field: &'static str) -> DecodeError {
        DecodeError::MissingField { ty: self.ty, field }
    }

    fn invalid(&self, field: &'static str) -> DecodeError {
        DecodeError::InvalidField { ty: self.ty, field }
    }

    pub(crate) fn required_str(&mut self, name: &'static str) -> Result<String, DecodeError> {
        self.optional_str(name)?.ok_or_else(|| self.missing(name))
    }

    pub(crate) fn optional_str(&mut self, name: &'static str) -> Result<Option<String>, DecodeError> {
        match self.take(name) {
            None => Ok(None),
            Some(value) => value
                .as_str()
                .map(|s| Some(s.to_owned()))
                .ok_or_else(|| self.invalid(name)),
        }
    }

    pub(crate) fn required_port(&mut self, name: &'static str) -> Result<u16, DecodeError> {
        let value = self.take(name).ok_or_else(|| self.missing(name))?;
        value
            .as_u64()
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| self.invalid(name))
    }

    /// Free-form value maps default to empty when absent.
    pub(crate) fn optional_values(&mut self, name: &'static str) -> Result<Values, DecodeError> {
        let Some(value) = self.take(name) else {
            return Ok(Values::new());
        };
        let entries = value.as_map().ok_or_else(|| self.invalid(name))?;
        let mut values = Values::new();
        for (key, value) in entries {
            let key = key.as_str().ok_or_else(|| self.invalid(name))?;
            values.insert(key.to_owned(), value.clone());
        }
        Ok(values)
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        let leftover = self
            .entries
            .iter()
            .zip(&self.taken)
            .find(|(_, taken)| !**taken)
            .map(|((key, _), _)| key);

        match leftover {
            None => Ok(()),
            Some(key) => Err(DecodeError::UnexpectedField {
                ty: self.ty,
                field: key
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| key.to_string()),
            }),
        }
    }
}

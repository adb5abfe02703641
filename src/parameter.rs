//! Typed, introspectable camera parameters.
//!
//! Every tunable of a camera is published as a first-class named descriptor
//! carrying its value type, constraint, unit and access rules, so a client
//! can enumerate, read and write device settings without prior knowledge of
//! the backend.
//!
//! # Architecture
//!
//! - [`ParameterValue`]: tagged union in which values transit between the
//!   client, the runtime and the backend.
//! - [`ParameterDescriptor`]: static declaration of one parameter, built
//!   with a fluent API (`with_range`, `with_choices`, `read_only`, ...).
//! - [`ParameterRegistry`]: declaration-ordered descriptor table with name
//!   lookup and candidate-value validation.
//!
//! Validation happens entirely in this layer: a backend never sees a value
//! that violates the declared type, range, step or choice set. Cross-field
//! constraints (e.g. ROI against sensor bounds) remain with the backend,
//! which may still reject a write with [`CameraError::OutOfRange`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{CamResult, CameraError};

// =============================================================================
// ParameterValue - tagged value union
// =============================================================================

/// Strongly-typed value for parameter reads and writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer (pixel counts, indices, frame counts).
    UInt(u64),
    /// 64-bit float (times, rates, temperatures).
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Index into an enumeration constraint's value list.
    EnumIndex(u32),
    /// Opaque byte blob for device side channels.
    Blob(Vec<u8>),
}

/// Type tag of a [`ParameterValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Boolean flag.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// Unsigned 64-bit integer.
    UInt,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    String,
    /// Enumeration index.
    EnumIndex,
    /// Opaque byte blob.
    Blob,
}

impl ValueType {
    /// Human-readable tag name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::UInt => "uint",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::EnumIndex => "enum",
            ValueType::Blob => "blob",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ParameterValue {
    /// Type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            ParameterValue::Bool(_) => ValueType::Bool,
            ParameterValue::Int(_) => ValueType::Int,
            ParameterValue::UInt(_) => ValueType::UInt,
            ParameterValue::Float(_) => ValueType::Float,
            ParameterValue::String(_) => ValueType::String,
            ParameterValue::EnumIndex(_) => ValueType::EnumIndex,
            ParameterValue::Blob(_) => ValueType::Blob,
        }
    }

    /// Extract value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Extract value as u64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParameterValue::UInt(u) => Some(*u),
            ParameterValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Extract value as f64, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    /// Extract value as string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract value as enumeration index.
    pub fn as_enum_index(&self) -> Option<u32> {
        match self {
            ParameterValue::EnumIndex(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::UInt(u) => write!(f, "{}", u),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::EnumIndex(i) => write!(f, "#{}", i),
            ParameterValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<u64> for ParameterValue {
    fn from(value: u64) -> Self {
        ParameterValue::UInt(value)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::UInt(value as u64)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Vec<u8>> for ParameterValue {
    fn from(value: Vec<u8>) -> Self {
        ParameterValue::Blob(value)
    }
}

// =============================================================================
// Metadata: units and access modes
// =============================================================================

/// Physical unit associated with a parameter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    /// Not applicable.
    #[default]
    Na,
    /// Length in SI meter.
    Meter,
    /// Time in SI second.
    Second,
    /// Number of pixels in one dimension.
    Pixel,
    /// Temperature in degree Celsius.
    DegreeCelsius,
    /// Generic number.
    Count,
}

/// Read/write access mode of a parameter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Value can only be read.
    ReadOnly,
    /// Value can only be written (e.g. command-like parameters).
    WriteOnly,
    /// Value can be read and written.
    #[default]
    ReadWrite,
}

impl Access {
    /// Whether `get` is permitted.
    pub fn is_readable(&self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    /// Whether `set` is permitted.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

// =============================================================================
// Constraints
// =============================================================================

/// Value constraint attached to a descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// All values of the declared type are accepted.
    #[default]
    None,

    /// Inclusive numeric range, with an optional step for quantized
    /// parameters (e.g. ROI dimensions with a hardware multiplier).
    Range {
        /// Minimum allowed value (inclusive).
        min: ParameterValue,
        /// Maximum allowed value (inclusive).
        max: ParameterValue,
        /// Step granularity relative to `min`, if the backend quantizes.
        step: Option<ParameterValue>,
    },

    /// Discrete set of allowed values (e.g. binning factors).
    Choices(Vec<ParameterValue>),

    /// Named enumeration; the value is an [`ParameterValue::EnumIndex`]
    /// into this list (e.g. trigger sources).
    Enumeration(Vec<String>),
}

impl Constraint {
    fn check(&self, name: &str, value: &ParameterValue) -> CamResult<()> {
        match self {
            Constraint::None => Ok(()),

            Constraint::Range { min, max, step } => {
                check_bounds(name, value, min, max)?;
                if let Some(step) = step {
                    check_step(name, value, min, step)?;
                }
                Ok(())
            }

            Constraint::Choices(choices) => {
                if choices.iter().any(|c| c == value) {
                    Ok(())
                } else {
                    Err(CameraError::OutOfRange {
                        name: name.to_string(),
                        message: format!("{} is not one of the allowed values", value),
                    })
                }
            }

            Constraint::Enumeration(names) => {
                let index = value.as_enum_index().unwrap_or(u32::MAX) as usize;
                if index < names.len() {
                    Ok(())
                } else {
                    Err(CameraError::OutOfRange {
                        name: name.to_string(),
                        message: format!(
                            "enum index {} outside 0..{}",
                            value,
                            names.len()
                        ),
                    })
                }
            }
        }
    }
}

fn check_bounds(
    name: &str,
    value: &ParameterValue,
    min: &ParameterValue,
    max: &ParameterValue,
) -> CamResult<()> {
    let out = |message: String| {
        Err(CameraError::OutOfRange {
            name: name.to_string(),
            message,
        })
    };

    match value {
        ParameterValue::Int(v) => {
            let (lo, hi) = (min.as_i64().unwrap_or(i64::MIN), max.as_i64().unwrap_or(i64::MAX));
            if *v < lo || *v > hi {
                return out(format!("{} outside [{}, {}]", v, lo, hi));
            }
        }
        ParameterValue::UInt(v) => {
            let (lo, hi) = (min.as_u64().unwrap_or(u64::MIN), max.as_u64().unwrap_or(u64::MAX));
            if *v < lo || *v > hi {
                return out(format!("{} outside [{}, {}]", v, lo, hi));
            }
        }
        ParameterValue::Float(v) => {
            let (lo, hi) = (
                min.as_f64().unwrap_or(f64::NEG_INFINITY),
                max.as_f64().unwrap_or(f64::INFINITY),
            );
            if !v.is_finite() || *v < lo || *v > hi {
                return out(format!("{} outside [{}, {}]", v, lo, hi));
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_step(
    name: &str,
    value: &ParameterValue,
    min: &ParameterValue,
    step: &ParameterValue,
) -> CamResult<()> {
    let (Some(v), Some(lo), Some(s)) = (value.as_u64(), min.as_u64(), step.as_u64()) else {
        return Ok(());
    };
    if s > 0 && (v - lo) % s != 0 {
        return Err(CameraError::OutOfRange {
            name: name.to_string(),
            message: format!("{} is not a multiple of the step {} from {}", v, s, lo),
        });
    }
    Ok(())
}

// =============================================================================
// ParameterDescriptor
// =============================================================================

/// Static declaration of one camera parameter.
///
/// Built with a fluent API:
///
/// ```rust,ignore
/// let exposure = ParameterDescriptor::new("exposure_time", 0.1)
///     .with_unit(Unit::Second)
///     .with_range(1e-6, 60.0)
///     .live_writable();
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    /// Unique parameter name (snake_case, e.g. "exposure_time").
    pub name: String,
    /// Value type every read and write must carry.
    pub value_type: ValueType,
    /// Initial value of the parameter.
    pub default: ParameterValue,
    /// Constraint applied to writes.
    pub constraint: Constraint,
    /// Physical unit tag.
    pub unit: Unit,
    /// Access mode.
    pub access: Access,
    /// Whether the parameter may be written while the camera records.
    pub writable_during_acquisition: bool,
}

impl ParameterDescriptor {
    /// Create a read/write descriptor; the value type is inferred from the
    /// default.
    pub fn new(name: impl Into<String>, default: impl Into<ParameterValue>) -> Self {
        let default = default.into();
        Self {
            name: name.into(),
            value_type: default.value_type(),
            default,
            constraint: Constraint::None,
            unit: Unit::Na,
            access: Access::ReadWrite,
            writable_during_acquisition: false,
        }
    }

    /// Attach a physical unit.
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Constrain to an inclusive range.
    pub fn with_range(
        mut self,
        min: impl Into<ParameterValue>,
        max: impl Into<ParameterValue>,
    ) -> Self {
        self.constraint = Constraint::Range {
            min: min.into(),
            max: max.into(),
            step: None,
        };
        self
    }

    /// Advertise a step granularity on an existing range constraint.
    pub fn with_step(mut self, step: impl Into<ParameterValue>) -> Self {
        if let Constraint::Range { step: slot, .. } = &mut self.constraint {
            *slot = Some(step.into());
        }
        self
    }

    /// Constrain to a discrete set of allowed values.
    pub fn with_choices(mut self, choices: Vec<ParameterValue>) -> Self {
        self.constraint = Constraint::Choices(choices);
        self
    }

    /// Constrain to a named enumeration; values are indices into `names`.
    pub fn with_enumeration(mut self, names: Vec<String>) -> Self {
        self.constraint = Constraint::Enumeration(names);
        self
    }

    /// Make the parameter read-only.
    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    /// Make the parameter write-only.
    pub fn write_only(mut self) -> Self {
        self.access = Access::WriteOnly;
        self
    }

    /// Allow writes while the camera is recording.
    pub fn live_writable(mut self) -> Self {
        self.writable_during_acquisition = true;
        self
    }

    /// Validate a candidate value against type and constraint.
    pub fn validate(&self, value: &ParameterValue) -> CamResult<()> {
        if value.value_type() != self.value_type {
            return Err(CameraError::TypeMismatch {
                name: self.name.clone(),
                expected: self.value_type.name(),
                actual: value.value_type().name(),
            });
        }
        self.constraint.check(&self.name, value)
    }
}

// =============================================================================
// ParameterRegistry
// =============================================================================

/// Declaration-ordered table of parameter descriptors.
///
/// Backends build one registry and hand it to the camera runtime; listing
/// preserves the order in which descriptors were registered.
#[derive(Clone, Debug, Default)]
pub struct ParameterRegistry {
    descriptors: Vec<ParameterDescriptor>,
    index: HashMap<String, usize>,
}

impl ParameterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous declaration with the
    /// same name in place (the original declaration order is kept).
    pub fn register(&mut self, descriptor: ParameterDescriptor) {
        match self.index.get(&descriptor.name) {
            Some(&i) => self.descriptors[i] = descriptor,
            None => {
                self.index
                    .insert(descriptor.name.clone(), self.descriptors.len());
                self.descriptors.push(descriptor);
            }
        }
    }

    /// Descriptors in declaration order.
    pub fn list(&self) -> &[ParameterDescriptor] {
        &self.descriptors
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Look up a descriptor by name.
    pub fn descriptor(&self, name: &str) -> CamResult<&ParameterDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| CameraError::NotFound(name.to_string()))
    }

    /// Check that `name` may be read.
    pub fn validate_read(&self, name: &str) -> CamResult<&ParameterDescriptor> {
        let descriptor = self.descriptor(name)?;
        if !descriptor.access.is_readable() {
            return Err(CameraError::AccessDenied(name.to_string()));
        }
        Ok(descriptor)
    }

    /// Check that `value` may be written to `name` in the given recording
    /// state. On success the backend is guaranteed to receive a value that
    /// satisfies the declared type and constraint.
    pub fn validate_write(
        &self,
        name: &str,
        value: &ParameterValue,
        recording: bool,
    ) -> CamResult<&ParameterDescriptor> {
        let descriptor = self.descriptor(name)?;
        if !descriptor.access.is_writable() {
            return Err(CameraError::AccessDenied(name.to_string()));
        }
        if recording && !descriptor.writable_during_acquisition {
            return Err(CameraError::BusyRecording(name.to_string()));
        }
        descriptor.validate(value)?;
        Ok(descriptor)
    }
}

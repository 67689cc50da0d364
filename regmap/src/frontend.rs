//! Parsers for register map databases

pub(crate) mod json;

//! LDAP result codes (RFC 4511 appendix A).
//!
//! Responses carry a result code as `i16`; these constants cover the
//! commonly used portion of the space.

pub const SUCCESS: i16 = 0;
pub const OPERATIONS_ERROR: i16 = 1;
pub const PROTOCOL_ERROR: i16 = 2;
pub const TIME_LIMIT_EXCEEDED: i16 = 3;
pub const SIZE_LIMIT_EXCEEDED: i16 = 4;
pub const COMPARE_FALSE: i16 = 5;
pub const COMPARE_TRUE: i16 = 6;
pub const AUTH_METHOD_NOT_SUPPORTED: i16 = 7;
pub const STRONGER_AUTH_REQUIRED: i16 = 8;
pub const REFERRAL: i16 = 10;
pub const ADMIN_LIMIT_EXCEEDED: i16 = 11;
pub const UNAVAILABLE_CRITICAL_EXTENSION: i16 = 12;
pub const CONFIDENTIALITY_REQUIRED: i16 = 13;
pub const SASL_BIND_IN_PROGRESS: i16 = 14;
pub const NO_SUCH_ATTRIBUTE: i16 = 16;
pub const UNDEFINED_ATTRIBUTE_TYPE: i16 = 17;
pub const INAPPROPRIATE_MATCHING: i16 = 18;
pub const CONSTRAINT_VIOLATION: i16 = 19;
pub const ATTRIBUTE_OR_VALUE_EXISTS: i16 = 20;
pub const INVALID_ATTRIBUTE_SYNTAX: i16 = 21;
pub const NO_SUCH_OBJECT: i16 = 32;
pub const ALIAS_PROBLEM: i16 = 33;
pub const INVALID_DN_SYNTAX: i16 = 34;
pub const ALIAS_DEREFERENCING_PROBLEM: i16 = 36;
pub const INAPPROPRIATE_AUTHENTICATION: i16 = 48;
pub const INVALID_CREDENTIALS: i16 = 49;
pub const INSUFFICIENT_ACCESS_RIGHTS: i16 = 50;
pub const BUSY: i16 = 51;
pub const UNAVAILABLE: i16 = 52;
pub const UNWILLING_TO_PERFORM: i16 = 53;
pub const LOOP_DETECT: i16 = 54;
pub const NAMING_VIOLATION: i16 = 64;
pub const OBJECT_CLASS_VIOLATION: i16 = 65;
pub const NOT_ALLOWED_ON_NON_LEAF: i16 = 66;
pub const NOT_ALLOWED_ON_RDN: i16 = 67;
pub const ENTRY_ALREADY_EXISTS: i16 = 68;
pub const OBJECT_CLASS_MODS_PROHIBITED: i16 = 69;
pub const AFFECTS_MULTIPLE_DSAS: i16 = 71;
pub const OTHER: i16 = 80;

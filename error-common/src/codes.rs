// Error codes implementation
// This module contains standardized error codes for the ModHost engine

pub mod conflict {
    pub const CYCLIC_DEPENDENCY: &str = "CONFLICT_1001";
    pub const VERSION_CONFLICT: &str = "CONFLICT_1002";
    pub const OPERATION_IN_PROGRESS: &str = "CONFLICT_1003";
    pub const ALREADY_INSTALLED: &str = "CONFLICT_1004";
    pub const NOT_INSTALLED: &str = "CONFLICT_1005";
    pub const REQUIRED_BY_DEPENDENTS: &str = "CONFLICT_1006";
    pub const MODULE_NOT_FOUND: &str = "CONFLICT_1007";
    pub const INVALID_TRANSITION: &str = "CONFLICT_1008";
}

pub mod security {
    pub const SCAN_FAILURE: &str = "SCAN_2001";
    pub const SCANNER_UNAVAILABLE: &str = "SCAN_2002";
    pub const INTEGRITY_MISMATCH: &str = "SCAN_2003";
}

pub mod authorization {
    pub const PERMISSION_DENIED: &str = "AUTHZ_3001";
}

pub mod resource {
    pub const PROVISIONING_FAILED: &str = "RESOURCE_4001";
    pub const ISOLATION_UNAVAILABLE: &str = "RESOURCE_4002";
    pub const BACKEND_MISSING: &str = "RESOURCE_4003";
    pub const RESOURCE_VIOLATION: &str = "RESOURCE_4004";
}

pub mod transient {
    pub const STORAGE_UNAVAILABLE: &str = "TRANSIENT_5001";
    pub const STEP_TIMEOUT: &str = "TRANSIENT_5002";
}

pub mod lifecycle {
    pub const CANCELLED: &str = "LIFECYCLE_6001";
    pub const COMPENSATION_EXHAUSTED: &str = "LIFECYCLE_6002";
    pub const INVALID_STATE: &str = "LIFECYCLE_6003";
    pub const NOT_FOUND: &str = "LIFECYCLE_6004";
}

pub mod internal {
    pub const STEP_LOG: &str = "INTERNAL_9001";
    pub const SERIALIZATION: &str = "INTERNAL_9002";
    pub const UNEXPECTED: &str = "INTERNAL_9999";
}

pub const POLICIES_NOT_ACCEPTED: &str = "policies_not_accepted";
pub const CLIENT_VERSION_UNSUPPORTED: &str = "client_version_unsupported";
pub const OLM_SESSION_CREATION_FAILURE: &str = "olm_session_creation_failure";

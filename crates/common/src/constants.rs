// Storage paths. Key configuration is seal-wrapped; verification audit is local-only.
pub const JWS_KEY_CONFIG_PATH: &str = "config/keys/jws";
pub const CLIENT_KEY_CONFIG_PATH: &str = "config/keys/client";
pub const DESTINATION_PREFIX: &str = "destination/";
pub const VERIFY_PREFIX: &str = "verify/";

// Route paths.
pub const PATH_CONFIG_JWS: &str = "config/keys/jws";
pub const PATH_CONFIG_JWS_PURGE: &str = "config/keys/jws/purge";
pub const PATH_JWS_CERTIFICATE: &str = "keys/jws/certificate";
pub const PATH_JWS_JWKS: &str = "keys/jws/jwks";
pub const PATH_CONFIG_CLIENT: &str = "config/keys/client";
pub const PATH_CONFIG_CLIENT_PURGE: &str = "config/keys/client/purge";
pub const PATH_CLIENT_CERTIFICATE: &str = "keys/client/certificate";
pub const PATH_CONFIG_DESTINATION: &str = "config/destination";
pub const PATH_CONFIG_DESTINATIONS: &str = "config/destinations";
pub const PATH_DESTINATION_PREFIX: &str = "destination/";
pub const PATH_SIGN_PREFIX: &str = "sign/";
pub const PATH_VERIFY: &str = "verify";

pub const JWS_TYPE: &str = "JWT";

pub const BACKEND_HELP: &str = "\
The webhook backend signs outbound HTTP request payloads with JWS on behalf of privileged \
callers, publishes the public keys relying parties verify them with, and verifies inbound \
signed requests against a registry of allowed destinations.";

mod api;

pub use api::{
    AuditLogQuery, AuditLogResponse, AuthInfoResponse, HealthResponse, IsAdminResponse,
    LoginResponse, LogoutResponse, MeResponse, RotateSecretResponse, SessionInfoResponse,
    UserInfo, VerifyResponse,
};

use serde::Deserialize;

/// Request body for registration. Fields default to empty so that missing
/// values surface as validation errors rather than body rejections.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub birthday: String,
    #[serde(default)]
    pub bio: Option<String>,
}

/// Request body for login.
#[derive(Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Request body for changing the password of the signed-in account.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
}

/// Request body carrying the token from a verification mail.
#[derive(Clone, Deserialize)]
pub struct VerifyEmailRequest {
    #[serde(default)]
    pub token: String,
}

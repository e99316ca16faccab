use server_api::ApiContext;

use crate::auth::Authenticator;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) auth: Authenticator,
}

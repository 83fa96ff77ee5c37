mod auth;
mod health_check;

pub use auth::{
    change_password, forgot_password, get_current_user, login, logout, refresh, register,
    ResetDelivery,
};
pub use health_check::health_check;

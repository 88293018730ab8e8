pub mod completions;
pub mod configure;
pub mod login;
pub mod logout;
pub mod renew;

pub use completions::CompletionsCommand;
pub use configure::ConfigureCommand;
pub use login::LoginCommand;
pub use logout::LogoutCommand;
pub use renew::RenewCommand;

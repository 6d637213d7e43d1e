pub mod server;

pub use self::server::Args;

#[derive(Debug)]
pub enum Action {
    Server(Args),
}

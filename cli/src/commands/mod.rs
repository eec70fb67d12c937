pub mod create;
pub mod lock;
pub mod restore;
pub mod verify;

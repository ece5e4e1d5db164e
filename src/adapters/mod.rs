pub mod api;
pub mod db;
pub mod enode;
pub mod push;

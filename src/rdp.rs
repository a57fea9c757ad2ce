pub mod conn;
pub mod defs;
pub mod input;
pub mod output;
pub mod packet;
pub mod seq;
pub mod table;
pub mod timer;
pub mod usrreq;

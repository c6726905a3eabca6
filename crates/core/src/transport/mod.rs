//! Network listeners: a reliable TCP handshake/read loop per connection and
//! a single shared UDP receive loop that demuxes datagrams by session slot.

pub mod tcp;
pub mod udp;

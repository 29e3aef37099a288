pub mod scripted_page;
pub mod socket_guard;

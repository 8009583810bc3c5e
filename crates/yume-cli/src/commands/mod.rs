pub mod doctor;
pub mod logging;
pub mod serve;

pub mod bot;
pub mod trade_record;
pub mod trade_request;

pub mod trade_services;

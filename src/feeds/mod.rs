pub mod price_api;

mod clear_cache;
mod find_restaurants;
mod restaurant_details;

pub use crate::clear_cache::ClearRestaurantCacheTool;
pub use crate::find_restaurants::FindRestaurantsTool;
pub use crate::restaurant_details::RestaurantDetailsTool;

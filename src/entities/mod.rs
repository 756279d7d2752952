pub mod cart;
pub mod cart_item;
pub mod checkout_session;
pub mod order;
pub mod order_item;
pub mod order_status_history;

pub use cart::Entity as Cart;
pub use cart::Model as CartModel;
pub use cart_item::Entity as CartItem;
pub use cart_item::Model as CartItemModel;
pub use checkout_session::Entity as CheckoutSession;
pub use checkout_session::Model as CheckoutSessionModel;
pub use order::Entity as Order;
pub use order::Model as OrderModel;
pub use order_item::Entity as OrderItem;
pub use order_item::Model as OrderItemModel;
pub use order_status_history::Entity as OrderStatusHistory;
pub use order_status_history::Model as OrderStatusHistoryModel;

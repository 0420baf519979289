// Wire protocol shared between the sync engine and the session store.

pub mod api;

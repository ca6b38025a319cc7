pub mod outbox_repo;

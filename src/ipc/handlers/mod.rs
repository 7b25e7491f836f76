pub mod accounts;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod courses;
pub mod enrollments;
pub mod grades;
pub mod reports;
pub mod students;
pub mod teachers;

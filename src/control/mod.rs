//! Closed-loop controllers.

pub mod flow_loop;

pub mod cashflow_model;

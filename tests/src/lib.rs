//! Integration tests for the ropforge workspace.


#[cfg(test)]
mod core;

#[cfg(test)]
mod rop;

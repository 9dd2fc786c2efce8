mod divergence;
mod pass;
mod symver;

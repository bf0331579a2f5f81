mod cache;
mod eval;
mod loops;
mod primitives;

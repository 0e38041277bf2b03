mod index_set;
mod marking;
mod problem;
mod space;
